use serde::Deserialize;

/// Top-level configuration settings for the application.
#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct Settings {
    pub server: ServerSettings,
    pub broker: BrokerSettings,
    pub coap: CoapSettings,
    pub auth: AuthSettings,
    pub log: LogSettings,
}

/// UDP address the CoAP server binds to.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

/// Backend selection.
///
/// `url`'s scheme picks the driver (`mem://`, `amqp://`, `mqtt://`). With
/// `queue` set every subscription joins that queue group.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BrokerSettings {
    pub url: String,
    pub queue: Option<String>,
}

/// Observe keep-alive and confirmable retransmission parameters.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct CoapSettings {
    pub keep_alive_secs: u64,
    pub ack_timeout_ms: u64,
    pub max_retransmit: u32,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AuthSettings {
    pub jwt_secret: String,
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct LogSettings {
    pub level: String,
}

/// Partial configuration settings loaded from files or environment.
///
/// Allows partial specification of settings. Missing values are filled from
/// `Settings::default()`.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub broker: Option<PartialBrokerSettings>,
    pub coap: Option<PartialCoapSettings>,
    pub auth: Option<PartialAuthSettings>,
    pub log: Option<PartialLogSettings>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialBrokerSettings {
    pub url: Option<String>,
    pub queue: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialCoapSettings {
    pub keep_alive_secs: Option<u64>,
    pub ack_timeout_ms: Option<u64>,
    pub max_retransmit: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialAuthSettings {
    pub jwt_secret: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLogSettings {
    pub level: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5683,
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            url: "mem://".to_string(),
            queue: None,
        }
    }
}

impl Default for CoapSettings {
    fn default() -> Self {
        Self {
            keep_alive_secs: 3600,
            ack_timeout_ms: 2000,
            max_retransmit: 3,
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: "change-me".to_string(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Fill every value missing from `partial` with its default.
    pub fn merge(partial: PartialSettings) -> Self {
        let default = Settings::default();
        let server = partial.server.unwrap_or_default();
        let broker = partial.broker.unwrap_or_default();
        let coap = partial.coap.unwrap_or_default();
        let auth = partial.auth.unwrap_or_default();
        let log = partial.log.unwrap_or_default();

        Settings {
            server: ServerSettings {
                host: server.host.unwrap_or(default.server.host),
                port: server.port.unwrap_or(default.server.port),
            },
            broker: BrokerSettings {
                url: broker.url.unwrap_or(default.broker.url),
                queue: broker.queue.filter(|q| !q.is_empty()).or(default.broker.queue),
            },
            coap: CoapSettings {
                keep_alive_secs: coap.keep_alive_secs.unwrap_or(default.coap.keep_alive_secs),
                ack_timeout_ms: coap.ack_timeout_ms.unwrap_or(default.coap.ack_timeout_ms),
                max_retransmit: coap.max_retransmit.unwrap_or(default.coap.max_retransmit),
            },
            auth: AuthSettings {
                jwt_secret: auth.jwt_secret.unwrap_or(default.auth.jwt_secret),
            },
            log: LogSettings {
                level: log.level.unwrap_or(default.log.level),
            },
        }
    }

    /// `host:port` the CoAP server binds to.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
