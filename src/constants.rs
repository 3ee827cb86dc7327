pub const DEFAULT_PROKNOW_BASE_URL: &str = "https://nhs.proknow.com";
pub const DEFAULT_CSV_PATH: &str = "./custom_metrics.csv";
pub const DEFAULT_LOG_DIR: &str = "./log";

pub const USER_AGENT: &str = "proknow-metrics/0.1";

pub const LOG_SEPARATOR: &str =
    " ----------------------------------------------------------------------- ";

/// Entity contexts walked by the collection-wide commands, in output order.
pub const ENTITY_CONTEXTS: [&str; 4] = ["plan", "dose", "image_set", "structure_set"];
