//! Endpoint and region sizing.

use std::path::PathBuf;

use crate::proto::SMR_INJECT_SIZE;

/// Sizes of the shared structures in a region plus the endpoint-local
/// pools that sit next to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmrConfig {
    /// Command queue slots (power of 2). Also the initial credit.
    pub cmd_queue_size: u32,
    /// Response queue slots (power of 2).
    pub resp_queue_size: u32,
    /// Inject buffers in the region's pool.
    pub inject_count: u32,
    /// Unexpected-message entries the endpoint can hold.
    pub unexp_count: u32,
    /// Posted receives per match queue.
    pub recv_count: u32,
    /// A multi-receive buffer is retired once less than this remains.
    pub min_multi_recv_size: usize,
    /// Directory holding mapped-file transfers.
    pub map_dir: PathBuf,
    /// Allow direct cross-process copies for large payloads.
    pub cma: bool,
}

impl Default for SmrConfig {
    fn default() -> Self {
        Self {
            cmd_queue_size: 256,
            resp_queue_size: 256,
            inject_count: 256,
            unexp_count: 256,
            recv_count: 256,
            min_multi_recv_size: SMR_INJECT_SIZE,
            map_dir: PathBuf::from("/dev/shm"),
            cma: true,
        }
    }
}

impl SmrConfig {
    /// Defaults overlaid with `SMR_*` environment variables. Unparseable
    /// values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::default().with_vars(|key| std::env::var(key).ok())
    }

    fn with_vars(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>, slot: &mut T) {
            let Some(raw) = raw else { return };
            match raw.trim().parse() {
                Ok(v) => *slot = v,
                Err(_) => warn!(key, value = %raw, "ignoring unparseable setting"),
            }
        }

        parse("SMR_CMD_QUEUE_SIZE", var("SMR_CMD_QUEUE_SIZE"), &mut self.cmd_queue_size);
        parse("SMR_RESP_QUEUE_SIZE", var("SMR_RESP_QUEUE_SIZE"), &mut self.resp_queue_size);
        parse("SMR_INJECT_COUNT", var("SMR_INJECT_COUNT"), &mut self.inject_count);
        parse("SMR_UNEXP_COUNT", var("SMR_UNEXP_COUNT"), &mut self.unexp_count);
        parse("SMR_RECV_COUNT", var("SMR_RECV_COUNT"), &mut self.recv_count);
        parse("SMR_MIN_MULTI_RECV", var("SMR_MIN_MULTI_RECV"), &mut self.min_multi_recv_size);
        if let Some(dir) = var("SMR_MAP_DIR") {
            self.map_dir = PathBuf::from(dir);
        }
        if var("SMR_DISABLE_CMA").is_some_and(|v| v.trim() == "1") {
            self.cma = false;
        }
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !self.cmd_queue_size.is_power_of_two() {
            return Err("cmd_queue_size must be a power of 2");
        }
        if !self.resp_queue_size.is_power_of_two() {
            return Err("resp_queue_size must be a power of 2");
        }
        if self.cmd_queue_size < 2 {
            return Err("cmd_queue_size must hold an RMA command and its descriptor");
        }
        if self.inject_count == 0 {
            return Err("inject_count must be > 0");
        }
        if self.unexp_count == 0 {
            return Err("unexp_count must be > 0");
        }
        if self.recv_count == 0 {
            return Err("recv_count must be > 0");
        }
        Ok(())
    }
}
