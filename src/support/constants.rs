pub const BIN_NAME: &str = "relaykeeper";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/relaykeeper/agent.yaml";
pub const DEFAULT_LOG_FILTER: &str = "relaykeeper=info";

pub const DEFAULT_LOG_LINES: usize = 200;
pub const MAX_LOG_LINES: usize = 5000;

pub const EVENT_HISTORY_LIMIT: usize = 500;
pub const CLIENT_QUEUE_SIZE: usize = 256;

pub const DEFAULT_BUCKET_SECS: i64 = 300;
pub const SPIKE_HISTORY_POINTS: usize = 10;
