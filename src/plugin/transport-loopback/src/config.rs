use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopbackConfig {
    pub boards: u8,
    pub endpoints_per_board: u8,
    /// Address of board 0, the others follow.
    pub board_addr_base: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        LoopbackConfig {
            boards: 1,
            endpoints_per_board: 8,
            board_addr_base: 0x0060_dd00_0000,
        }
    }
}

impl LoopbackConfig {
    pub fn new(config: Option<&str>) -> anyhow::Result<Self> {
        let config = toml::from_str(config.unwrap_or(""))?;
        Ok(config)
    }
}
