use std::time::Duration;

/// Tunables for the delivery core. The server fills these from the
/// environment; tests usually shrink `typing_expiry`.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// How long a typing indicator lives without another `StartTyping`.
    pub typing_expiry: Duration,
    /// Upper bound on any single store call before the issuer gets a timeout
    /// ack. A send is bounded as a whole, fan-out and counting included.
    pub store_timeout: Duration,
    /// Server sends a Ping this often.
    pub heartbeat_interval: Duration,
    /// Consecutive unanswered pings before the connection is dropped.
    pub max_missed_heartbeats: u8,
    /// Longest accepted message body, in characters.
    pub max_body_len: usize,
    /// Longest accepted reaction symbol, in characters.
    pub max_symbol_len: usize,
    /// Cap on `FetchHistory` page size.
    pub history_page_max: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            typing_expiry: Duration::from_secs(5),
            store_timeout: Duration::from_secs(5),
            heartbeat_interval: Duration::from_secs(15),
            max_missed_heartbeats: 2,
            max_body_len: 4000,
            max_symbol_len: 32,
            history_page_max: 200,
        }
    }
}
