use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::Framed;

use fieldmq_codec::{Codec, Packet};

use crate::error::EngineError;
use crate::settings::Settings;

/// Framed MQTT connection to the broker, plain TCP or rustls TLS.
pub(crate) enum MqttStream {
    Tcp(Framed<TcpStream, Codec>),
    Tls(Box<Framed<TlsStream<TcpStream>, Codec>>),
}

impl MqttStream {
    pub(crate) async fn connect(
        settings: &Settings,
        tls: Option<&Arc<ClientConfig>>,
    ) -> Result<Self, EngineError> {
        let connect_timeout = Duration::from_secs(settings.connect_timeout);
        let tcp = tokio::time::timeout(connect_timeout, TcpStream::connect(settings.server.addr.as_str()))
            .await
            .map_err(|_| EngineError::ReadTimeout)??;
        tcp.set_nodelay(true)?;

        let codec = Codec::new(settings.max_packet_size);
        match tls {
            None => Ok(MqttStream::Tcp(Framed::new(tcp, codec))),
            Some(cfg) => {
                let name = ServerName::try_from(settings.server.host().to_owned())
                    .map_err(|e| EngineError::Config(format!("invalid TLS server name, {e}")))?;
                let connector = TlsConnector::from(cfg.clone());
                let io = tokio::time::timeout(connect_timeout, connector.connect(name, tcp))
                    .await
                    .map_err(|_| EngineError::ReadTimeout)??;
                Ok(MqttStream::Tls(Box::new(Framed::new(io, codec))))
            }
        }
    }

    #[inline]
    pub(crate) async fn send(&mut self, packet: Packet, tm: Duration) -> Result<(), EngineError> {
        match self {
            MqttStream::Tcp(io) => send(io, packet, tm).await,
            MqttStream::Tls(io) => send(io, packet, tm).await,
        }
    }

    /// Receive the next packet, `Ok(None)` meaning the peer closed the stream.
    #[inline]
    pub(crate) async fn recv(&mut self, tm: Duration) -> Result<Option<Packet>, EngineError> {
        match self {
            MqttStream::Tcp(io) => recv(io, tm).await,
            MqttStream::Tls(io) => recv(io, tm).await,
        }
    }

    #[inline]
    pub(crate) async fn close(&mut self, tm: Duration) -> Result<(), EngineError> {
        match self {
            MqttStream::Tcp(io) => close(io, tm).await,
            MqttStream::Tls(io) => close(io, tm).await,
        }
    }
}

#[inline]
async fn send<Io>(io: &mut Framed<Io, Codec>, packet: Packet, tm: Duration) -> Result<(), EngineError>
where
    Io: AsyncWrite + AsyncRead + Unpin,
{
    match tokio::time::timeout(tm, io.send(packet)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(EngineError::Encode(e)),
        Err(_) => Err(EngineError::WriteTimeout),
    }
}

#[inline]
async fn recv<Io>(io: &mut Framed<Io, Codec>, tm: Duration) -> Result<Option<Packet>, EngineError>
where
    Io: AsyncWrite + AsyncRead + Unpin,
{
    match tokio::time::timeout(tm, io.next()).await {
        Ok(Some(Ok((packet, _)))) => Ok(Some(packet)),
        Ok(Some(Err(e))) => Err(EngineError::Decode(e)),
        Ok(None) => Ok(None),
        Err(_) => Err(EngineError::ReadTimeout),
    }
}

#[inline]
async fn close<Io>(io: &mut Framed<Io, Codec>, tm: Duration) -> Result<(), EngineError>
where
    Io: AsyncWrite + AsyncRead + Unpin,
{
    match tokio::time::timeout(tm, io.close()).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(EngineError::Encode(e)),
        Err(_) => Err(EngineError::CloseTimeout),
    }
}

/// One-time TLS client setup: webpki roots plus optional PEM additions, ALPN
/// preference for "mqtt", optional mutual-TLS client identity.
pub(crate) fn build_tls_config(settings: &Settings) -> Result<Arc<ClientConfig>, EngineError> {
    let mut root_store = RootCertStore { roots: webpki_roots::TLS_SERVER_ROOTS.into() };

    if let Some(path) = &settings.root_cert {
        root_store.add_parsable_certificates(
            CertificateDer::pem_file_iter(path)
                .map_err(|e| EngineError::Config(format!("root_cert {path:?}, {e}")))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| EngineError::Config(format!("root_cert {path:?}, {e}")))?,
        );
    }

    let config = ClientConfig::builder().with_root_certificates(root_store);
    let mut config = if let (Some(client_cert), Some(client_key)) =
        (&settings.client_cert, &settings.client_key)
    {
        let certs = CertificateDer::pem_file_iter(client_cert)
            .map_err(|e| EngineError::Config(format!("client_cert {client_cert:?}, {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EngineError::Config(format!("client_cert {client_cert:?}, {e}")))?;
        let key = PrivateKeyDer::from_pem_file(client_key)
            .map_err(|e| EngineError::Config(format!("client_key {client_key:?}, {e}")))?;
        config
            .with_client_auth_cert(certs, key)
            .map_err(|e| EngineError::Config(format!("client auth, {e}")))?
    } else {
        config.with_no_client_auth()
    };
    config.alpn_protocols = vec![b"mqtt".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    #[test]
    fn test_tls_config_defaults() {
        let settings: Settings = toml::from_str(r#"server = "tls://broker.local:8883""#).unwrap();
        let cfg = build_tls_config(&settings).unwrap();
        assert_eq!(cfg.alpn_protocols, vec![b"mqtt".to_vec()]);
    }
}
