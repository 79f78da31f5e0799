use serde::Deserialize;

use std::{ffi, path};

use crate::{util::files, Result};

/// Default size of the first extent allocated for a collection, 64KB.
pub const EXTENT_SIZE: usize = 64 * 1024;
/// Default growth factor for every new extent allocated to a collection.
pub const EXTENT_GROWTH: usize = 4;
/// Default upper limit for extent size, 16MB.
pub const MAX_EXTENT_SIZE: usize = 16 * 1024 * 1024;
/// Default number of progress entries journaled before a flush.
pub const JOURNAL_FLUSH_EVERY: usize = 16;
/// Default number of records indexed between two yield points.
pub const BUILD_BATCH_SIZE: usize = 1000;

/// Configuration for [Database] type.
///
/// [Database]: crate::Database
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding collection data files and the build journal.
    pub dir: ffi::OsString,
    /// Size of the first extent allocated for a new collection.
    ///
    /// Default: [EXTENT_SIZE]
    pub extent_size: usize,
    /// Every subsequent extent is this many times bigger than the
    /// previous one, capped at `max_extent_size`.
    ///
    /// Default: [EXTENT_GROWTH]
    pub extent_growth: usize,
    /// Default: [MAX_EXTENT_SIZE]
    pub max_extent_size: usize,
    /// Enable fsync for every write to data files and journal flushes.
    ///
    /// Default: true
    pub fsync: bool,
    /// Number of build-progress entries batched before flushing the journal.
    /// Start, commit, done and abort entries are always flushed immediately.
    ///
    /// Default: [JOURNAL_FLUSH_EVERY]
    pub journal_flush_every: usize,
    /// Number of records processed by an index build between two yield
    /// points.
    ///
    /// Default: [BUILD_BATCH_SIZE]
    pub build_batch_size: usize,
    /// Serve diagnostic commands. When false, diagnostic commands respond
    /// with `{"bad cmd": true}`.
    ///
    /// Default: true
    pub diagnostics: bool,
}

impl<'a> arbitrary::Arbitrary<'a> for Config {
    fn arbitrary(u: &mut arbitrary::Unstructured) -> arbitrary::Result<Self> {
        use std::env;

        let dir = env::temp_dir().into_os_string();
        let extent_size = *u.choose(&[4096, 8192, 64 * 1024, 1024 * 1024])?;
        let extent_growth = *u.choose(&[1, 2, 4])?;
        let max_extent_size = *u.choose(&[64 * 1024, 1024 * 1024, MAX_EXTENT_SIZE])?;
        let journal_flush_every = *u.choose(&[1, 4, 16, 128])?;
        let build_batch_size = *u.choose(&[1, 10, 100, 1000])?;

        let config = Config {
            dir,
            extent_size,
            extent_growth,
            max_extent_size: usize::max(max_extent_size, extent_size),
            fsync: false,
            journal_flush_every,
            build_batch_size,
            diagnostics: true,
        };
        Ok(config)
    }
}

impl Config {
    /// Create a new configuration value, use the `set_*` methods to add more
    /// configuration.
    pub fn new(dir: &ffi::OsStr) -> Config {
        Config {
            dir: dir.to_os_string(),
            extent_size: EXTENT_SIZE,
            extent_growth: EXTENT_GROWTH,
            max_extent_size: MAX_EXTENT_SIZE,
            fsync: true,
            journal_flush_every: JOURNAL_FLUSH_EVERY,
            build_batch_size: BUILD_BATCH_SIZE,
            diagnostics: true,
        }
    }

    /// Load configuration from a toml file, parameters missing in the file
    /// shall take their default values.
    pub fn from_toml<P>(dir: &ffi::OsStr, loc: P) -> Result<Config>
    where
        P: AsRef<path::Path>,
    {
        let mut config: Config = files::load_toml::<_, TomlConfig>(loc)?.into();
        config.dir = dir.to_os_string();
        Ok(config)
    }

    /// Configure extent sizing, initial size, growth factor and the maximum
    /// size of a single extent.
    pub fn set_extent_size(&mut self, size: usize, growth: usize, max: usize) -> &mut Self {
        self.extent_size = size;
        self.extent_growth = usize::max(growth, 1);
        self.max_extent_size = usize::max(max, size);
        self
    }

    pub fn set_fsync(&mut self, fsync: bool) -> &mut Self {
        self.fsync = fsync;
        self
    }

    pub fn set_journal_flush_every(&mut self, n: usize) -> &mut Self {
        self.journal_flush_every = usize::max(n, 1);
        self
    }

    pub fn set_build_batch_size(&mut self, n: usize) -> &mut Self {
        self.build_batch_size = usize::max(n, 1);
        self
    }

    pub fn set_diagnostics(&mut self, enable: bool) -> &mut Self {
        self.diagnostics = enable;
        self
    }
}

impl Config {
    /// Size of the `n`th extent, counting from ZERO, allocated for a
    /// collection.
    pub fn to_extent_size(&self, n: usize) -> usize {
        let mut size = self.extent_size;
        for _ in 0..n {
            size = size.saturating_mul(self.extent_growth);
            if size >= self.max_extent_size {
                return self.max_extent_size;
            }
        }
        size
    }
}

/// Configuration parameters as read from a toml file.
#[derive(Clone, Default, Deserialize)]
pub struct TomlConfig {
    extent_size: Option<usize>,
    extent_growth: Option<usize>,
    max_extent_size: Option<usize>,
    fsync: Option<bool>,
    journal_flush_every: Option<usize>,
    build_batch_size: Option<usize>,
    diagnostics: Option<bool>,
}

impl From<TomlConfig> for Config {
    fn from(cfg: TomlConfig) -> Config {
        let def = Config::new(ffi::OsStr::new(""));
        let mut config = def.clone();
        config
            .set_extent_size(
                cfg.extent_size.unwrap_or(def.extent_size),
                cfg.extent_growth.unwrap_or(def.extent_growth),
                cfg.max_extent_size.unwrap_or(def.max_extent_size),
            )
            .set_fsync(cfg.fsync.unwrap_or(def.fsync))
            .set_journal_flush_every(
                cfg.journal_flush_every.unwrap_or(def.journal_flush_every),
            )
            .set_build_batch_size(cfg.build_batch_size.unwrap_or(def.build_batch_size))
            .set_diagnostics(cfg.diagnostics.unwrap_or(def.diagnostics));
        config
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;
