//! Configuration for contexts, file primitives and logging.
//!
//! Start from a preset such as [`AioConfig::journal`] or from
//! [`ConfigBuilder`], then hand the result to
//! [`IoContext::from_config`](crate::IoContext::from_config).

use crate::error::{AioError, Result};
use crate::logging::{ConsoleSink, FileSink, LogLevel, LogSink};
use std::path::PathBuf;

/// Largest queue depth accepted by [`AioConfig::validate`].
pub const MAX_QUEUE_DEPTH: u32 = 65536;

/// Complete engine configuration.
#[derive(Debug, Clone, Default)]
pub struct AioConfig {
    /// Context sizing and polling
    pub context: ContextConfig,
    /// File primitive behaviour
    pub file: FileConfig,
    /// Logging and metrics
    pub logging: LoggingConfig,
}

/// Per-context options.
#[derive(Debug, Clone)]
pub struct ContextConfig {
    /// Maximum in-flight operations
    pub queue_depth: u32,
    /// Sync each run of same-file completions in the blocking loop
    pub use_fdatasync: bool,
    /// Upper bound on events harvested per poll (0 = queue depth)
    pub max_events_per_poll: u32,
}

/// File primitive options.
#[derive(Debug, Clone)]
pub struct FileConfig {
    /// Open files with `O_DIRECT`
    pub direct_io: bool,
    /// Buffer and transfer alignment in bytes
    pub alignment: usize,
    /// Bytes written per step when zero-filling
    pub fill_chunk: usize,
}

/// Logging options.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Install the process logger when a context is built from this config
    pub enabled: bool,
    /// Minimum level
    pub level: LogLevel,
    /// Collect poll timings
    pub metrics: bool,
    /// Also append to this file
    pub log_file: Option<PathBuf>,
    /// Emit JSON instead of text
    pub json_format: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            queue_depth: 4096,
            use_fdatasync: false,
            max_events_per_poll: 0,
        }
    }
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            direct_io: true,
            alignment: 512,
            fill_chunk: 1024 * 1024,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: LogLevel::Info,
            metrics: false,
            log_file: None,
            json_format: false,
        }
    }
}

impl ContextConfig {
    /// Events harvested per poll once the 0 default is resolved.
    pub fn effective_max_events(&self) -> usize {
        if self.max_events_per_poll == 0 {
            self.queue_depth as usize
        } else {
            self.max_events_per_poll as usize
        }
    }
}

impl LoggingConfig {
    /// Outputs described by this section.
    pub fn sinks(&self) -> Vec<Box<dyn LogSink>> {
        let mut sinks: Vec<Box<dyn LogSink>> = Vec::new();
        if self.json_format {
            sinks.push(Box::new(ConsoleSink::new_json()));
        } else {
            sinks.push(Box::new(ConsoleSink::new()));
        }
        if let Some(path) = &self.log_file {
            if self.json_format {
                sinks.push(Box::new(FileSink::new_json(path)));
            } else {
                sinks.push(Box::new(FileSink::new(path)));
            }
        }
        sinks
    }

    /// Install and configure the process logger if enabled.
    pub fn apply(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let logger = crate::logging::init_logger();
        let mut logger = logger.lock().map_err(|_| AioError::PoolPoisoned)?;
        logger.set_level(self.level);
        logger.set_metrics_enabled(self.metrics);
        logger.set_sinks(self.sinks());
        Ok(())
    }
}

impl AioConfig {
    /// Journal workload: deep queue, direct I/O, group durability.
    pub fn journal() -> Self {
        Self {
            context: ContextConfig {
                queue_depth: 4096,
                use_fdatasync: true,
                max_events_per_poll: 0,
            },
            file: FileConfig::default(),
            logging: LoggingConfig {
                enabled: true,
                level: LogLevel::Warn,
                ..LoggingConfig::default()
            },
        }
    }

    /// Small queue so each poll stays short.
    pub fn low_latency() -> Self {
        Self {
            context: ContextConfig {
                queue_depth: 64,
                use_fdatasync: false,
                max_events_per_poll: 16,
            },
            ..Self::default()
        }
    }

    /// Debug logging with metrics.
    pub fn development() -> Self {
        Self {
            context: ContextConfig {
                queue_depth: 256,
                ..ContextConfig::default()
            },
            file: FileConfig::default(),
            logging: LoggingConfig {
                enabled: true,
                level: LogLevel::Debug,
                metrics: true,
                log_file: None,
                json_format: false,
            },
        }
    }

    /// Buffered I/O and a small queue, usable on tmpfs.
    pub fn testing() -> Self {
        Self {
            context: ContextConfig {
                queue_depth: 32,
                ..ContextConfig::default()
            },
            file: FileConfig {
                direct_io: false,
                ..FileConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        let depth = self.context.queue_depth;
        if depth == 0 || depth > MAX_QUEUE_DEPTH {
            return Err(AioError::InvalidArgument(format!(
                "queue depth {depth} must be between 1 and {MAX_QUEUE_DEPTH}"
            )));
        }

        if self.context.max_events_per_poll > depth {
            return Err(AioError::InvalidArgument(format!(
                "max events per poll {} exceeds queue depth {depth}",
                self.context.max_events_per_poll
            )));
        }

        let alignment = self.file.alignment;
        if !alignment.is_power_of_two() {
            return Err(AioError::InvalidArgument(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        let chunk = self.file.fill_chunk;
        if chunk == 0 || chunk % alignment != 0 {
            return Err(AioError::InvalidArgument(format!(
                "fill chunk {chunk} must be a non-zero multiple of {alignment}"
            )));
        }
        if chunk > crate::environment::ZERO_BLOCK_LEN {
            return Err(AioError::InvalidArgument(format!(
                "fill chunk {chunk} exceeds the {} byte zero block",
                crate::environment::ZERO_BLOCK_LEN
            )));
        }

        Ok(())
    }
}

/// Fluent construction of an [`AioConfig`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    config: AioConfig,
}

impl ConfigBuilder {
    /// Start from defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing configuration.
    pub fn from_config(config: AioConfig) -> Self {
        Self { config }
    }

    /// Replace the context section.
    pub fn context(mut self, context: ContextConfig) -> Self {
        self.config.context = context;
        self
    }

    /// Replace the file section.
    pub fn file(mut self, file: FileConfig) -> Self {
        self.config.file = file;
        self
    }

    /// Replace the logging section.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Set the queue depth.
    pub fn queue_depth(mut self, depth: u32) -> Self {
        self.config.context.queue_depth = depth;
        self
    }

    /// Turn group durability on or off.
    pub fn use_fdatasync(mut self, enabled: bool) -> Self {
        self.config.context.use_fdatasync = enabled;
        self
    }

    /// Turn `O_DIRECT` on or off.
    pub fn direct_io(mut self, enabled: bool) -> Self {
        self.config.file.direct_io = enabled;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<AioConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
