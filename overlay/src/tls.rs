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

//! TLS plumbing for the overlay. Peer identity is proven by the hello
//! signature over the session's shared value, not by X.509, so peers present
//! ephemeral self-signed certificates and accept any certificate in turn.

use crate::handshake::{HandshakeError, SharedValue};

use anyhow::Result;
use rustls::{
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    crypto::ring,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime},
    ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme,
};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_rustls::TlsStream;

/// The RFC 5705 exporter label for the session's shared value.
const EXPORTER_LABEL: &[u8] = b"EXPORTER-tessera-overlay-session";

/// Generates an ephemeral self-signed identity for the peer listener.
pub fn ephemeral_identity() -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certified = rcgen::generate_simple_self_signed(vec!["tessera".to_string()])?;
    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der()));
    Ok((vec![cert], key))
}

/// Builds the server-side TLS configuration from the given identity.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    Ok(ServerConfig::builder().with_no_client_auth().with_single_cert(certs, key)?)
}

/// Builds the client-side TLS configuration used to dial peers.
pub fn client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth()
}

/// Computes the shared value of the given TLS session.
///
/// Sessions that do not support the keying-material exporter (e.g. TLS 1.2
/// without extended master secret) cannot produce one; such peers cannot be
/// made compatible without a protocol bump.
pub fn shared_value(stream: &TlsStream<TcpStream>) -> Result<SharedValue, HandshakeError> {
    let secret = match stream {
        TlsStream::Client(inner) => {
            inner.get_ref().1.export_keying_material([0u8; 32], EXPORTER_LABEL, None)
        }
        TlsStream::Server(inner) => {
            inner.get_ref().1.export_keying_material([0u8; 32], EXPORTER_LABEL, None)
        }
    }
    .map_err(|_| HandshakeError::NoSharedValue)?;
    Ok(SharedValue(secret))
}

/// Accepts any peer certificate. The handshake's signed shared value carries
/// the authentication instead.
#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider().signature_verification_algorithms.supported_schemes()
    }
}
