// Copyright 2024 Tessera Contributors
// This file is part of the tessera library.

// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:

// http://www.apache.org/licenses/LICENSE-2.0

// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

mod hash_router;
pub use hash_router::{HashRouter, RELAYED};

mod manifest_cache;
pub use manifest_cache::{ManifestCache, ManifestDisposition, ManifestStore};

mod resource;
pub use resource::{Consumer, ResourceManager, TrafficCategory, TrafficCounts};
