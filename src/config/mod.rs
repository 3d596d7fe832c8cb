pub mod loader;
pub mod types;

pub use loader::{get_config_path, get_data_dir, get_store_dir, load_config};
pub use types::{EngineConfig, SandboxDefaults, StoreConfig, TaskboxConfig};
