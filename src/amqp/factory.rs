use crate::amqp::broker::AmqpConnection;
use crate::amqp::configuration::RabbitMqSettings;
use crate::transport::Transport;
use crate::Error;
use lapin::{
    tcp::{AMQPUriTcpExt, NativeTlsConnector},
    uri::{AMQPScheme, AMQPUri},
    ConnectionProperties,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::info;

#[derive(Clone)]
/// All the information required to connect to a RabbitMq broker.
pub struct ConnectionFactory {
    uri: AMQPUri,
    // What we log instead of `uri`.
    redacted_uri: String,
    /// The timeout observed when trying to connect to RabbitMq.
    connection_timeout: Duration,
    /// TLS configuration for the connection to RabbitMq.
    /// If `None`, the connection will not be encrypted.
    tls: Option<Arc<Tls>>,
    publisher_confirms: bool,
}

#[derive(Clone)]
struct Tls {
    connector: NativeTlsConnector,
    domain_name: String,
}

impl Tls {
    /// `None` when `settings` ask for a plain connection.
    fn from_settings(settings: &RabbitMqSettings, uri: &AMQPUri) -> Result<Option<Self>, Error> {
        if !settings.is_secure() {
            return Ok(None);
        }
        let mut connector_builder = NativeTlsConnector::builder();
        let domain_name = match &settings.tls {
            Some(tls_settings) => {
                if let Some(certificate) =
                    tls_settings.ca_certificate_chain().map_err(Error::Tls)?
                {
                    connector_builder.add_root_certificate(certificate);
                }
                tls_settings
                    .domain
                    .clone()
                    .unwrap_or_else(|| uri.authority.host.clone())
            }
            None => {
                connector_builder
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true);
                uri.authority.host.clone()
            }
        };
        let connector = connector_builder
            .build()
            .map_err(|e| Error::Tls(e.into()))?;
        Ok(Some(Self {
            connector,
            domain_name,
        }))
    }
}

impl ConnectionFactory {
    /// Create a new connection factory from settings.
    ///
    /// Secure connections without a CA certificate chain trust the system roots.
    /// Secure connections without any TLS settings accept any server certificate.
    ///
    /// A connection timeout can be (optionally) specified in `settings`.
    /// If the connection timeout is left unspecified, it will be defaulted to 10 seconds.
    pub fn new_from_config(settings: &RabbitMqSettings) -> Result<Self, Error> {
        let uri = settings.amqp_uri()?;
        let tls = Tls::from_settings(settings, &uri)?.map(Arc::new);
        let connection_timeout = settings
            .connection_timeout()
            .unwrap_or_else(|| Duration::from_secs(10));
        Ok(Self {
            redacted_uri: settings.redacted_uri()?,
            uri,
            connection_timeout,
            tls,
            publisher_confirms: settings.publisher_confirms,
        })
    }

    /// Replaces the TLS Connector for the connection factory
    pub fn set_tls_connector(&mut self, connector: NativeTlsConnector) {
        self.set_tls_connector_with_domain(connector, self.uri.authority.host.clone());
    }

    /// Replaces the TLS Connector for the connection factory, along with the expected domain name for the certificate
    pub fn set_tls_connector_with_domain(
        &mut self,
        connector: NativeTlsConnector,
        domain_name: String,
    ) {
        self.tls = Some(Arc::new(Tls {
            connector,
            domain_name,
        }));
    }

    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Create a new connection to a RabbitMq broker.
    ///
    /// It establishes an encrypted connection if `self.tls` is `Some`.
    /// It establishes an unencrypted connection if `self.tls` is `None`.
    #[tracing::instrument(name = "rabbitmq_connect", skip(self), fields(uri = %self.redacted_uri))]
    pub async fn new_connection(&self) -> Result<AmqpConnection, anyhow::Error> {
        let properties =
            ConnectionProperties::default().with_executor(tokio_executor_trait::Tokio::current());
        let connection = timeout(self.connection_timeout, async {
            match &self.tls {
                None => self.connect_without_tls(properties).await,
                Some(tls) => self.connect_with_tls(properties, Arc::clone(tls)).await,
            }
        })
        .await
        .map_err(|_| {
            anyhow::anyhow!(
                "Timed out after {:?} while trying to connect to RabbitMQ.",
                self.connection_timeout
            )
        })??;
        info!("connected to RabbitMQ");
        Ok(AmqpConnection::new(connection, self.publisher_confirms))
    }

    /// Establish a new unencrypted connection to a RabbitMq broker.
    async fn connect_without_tls(
        &self,
        properties: ConnectionProperties,
    ) -> Result<lapin::Connection, anyhow::Error> {
        let mut uri = self.uri.clone();
        // An explicit connector can be dropped in later on, the scheme follows the transport.
        uri.scheme = AMQPScheme::AMQP;
        Ok(lapin::Connection::connect_uri(uri, properties).await?)
    }

    /// Establish a new TLS connection to a RabbitMq broker.
    async fn connect_with_tls(
        &self,
        properties: ConnectionProperties,
        tls_configuration: Arc<Tls>,
    ) -> Result<lapin::Connection, anyhow::Error> {
        let connection = lapin::Connection::connector(
            self.uri.clone(),
            Box::new(move |uri| {
                // First establish a plain TCP connection using the AMQP protocol
                let mut amqp_uri = uri.clone();
                amqp_uri.scheme = AMQPScheme::AMQP;
                amqp_uri
                    .connect()
                    // Then perform a TLS handshake with custom settings
                    // including customisation of the expected domain for the server certificate
                    .and_then(|tcp| {
                        tcp.into_native_tls(
                            &tls_configuration.connector,
                            &tls_configuration.domain_name,
                        )
                    })
            }),
            properties,
        )
        .await?;
        Ok(connection)
    }
}

#[async_trait::async_trait]
impl Transport for ConnectionFactory {
    type Connection = AmqpConnection;

    async fn connect(&self) -> Result<AmqpConnection, anyhow::Error> {
        self.new_connection().await
    }
}
