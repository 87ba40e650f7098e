use std::path::PathBuf;

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Address the broker listens on; port 0 picks an ephemeral port.
    pub listen: String,
    /// Directory holding `meta.db` and the per-queue data files.
    pub base_dir: PathBuf,
    /// Worker threads executing delivery tasks.
    pub workers: usize,
}

impl Default for BrokerConfig {
    fn default() -> BrokerConfig {
        BrokerConfig {
            listen: "127.0.0.1:6672".to_string(),
            base_dir: PathBuf::from("quillmq-data"),
            workers: 4,
        }
    }
}
