use std::sync::OnceLock;

use serde::Deserialize;

fn default_heap_size() -> usize {
    16 * 1024 * 1024
}

fn default_eager_cutover() -> usize {
    4096
}

fn default_deadlock_timeout() -> f64 {
    600.0
}

fn default_backend() -> String {
    "loopback".to_owned()
}

fn default_bounce_align() -> usize {
    64
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// Size in bytes of the shared host segment exposed to remote ranks,
    /// default: 16MiB
    #[serde(default = "default_heap_size")]
    pub heap_size: usize,

    /// Packed commands at or below this many bytes travel by eager active
    /// message; larger commands go by rendezvous, default: 4096
    #[serde(default = "default_eager_cutover")]
    pub eager_cutover: usize,

    /// Seconds a blocking wait may spin without progress before a
    /// rank-tagged warning is printed, default: 600.0 seconds
    #[serde(default = "default_deadlock_timeout")]
    pub deadlock_timeout: f64,

    /// The fabric backend to use
    /// loopback -- in-process execution, every rank's segment is mapped
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Alignment for bounce buffers staged in the shared heap by the copy
    /// engine, default: 64
    #[serde(default = "default_bounce_align")]
    pub bounce_align: usize,
}

/// Get the current Environment Variable configuration
pub fn config() -> &'static Config {
    static CONFIG: OnceLock<Config> = OnceLock::new();
    CONFIG.get_or_init(|| match envy::prefixed("TESSERA_").from_env::<Config>() {
        Ok(config) => config,
        Err(error) => panic!("{}", error),
    })
}
