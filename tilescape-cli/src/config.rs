//! CLI configuration file.
//!
//! INI format, discovered at `<config dir>/tilescape/config.ini` unless a
//! path is given. Every key is optional; missing keys fall back to the
//! library defaults so an empty or absent file is valid. Translation into
//! library config types happens here, in one place.
//!
//! ```ini
//! [scheduler]
//! max_concurrent = 8
//!
//! [refinement]
//! sse_threshold = 16.0
//! max_level = 6
//! retained_budget = 512
//!
//! [simulation]
//! cycles = 240
//! frame_ms = 16
//! viewport_width = 800
//! viewport_height = 600
//! fetch_latency_ms = 5
//! fail_every = 0
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ini::Ini;
use tracing::debug;

use tilescape::prelude::{RefinementConfig, SchedulerConfig};

/// Default number of simulated frames.
pub const DEFAULT_CYCLES: u64 = 240;

/// Default simulated frame duration in milliseconds.
pub const DEFAULT_FRAME_MS: u64 = 16;

/// Default simulated fetch latency in milliseconds.
pub const DEFAULT_FETCH_LATENCY_MS: u64 = 5;

/// Default maximum tile level for the simulation (keeps tile counts
/// readable in reports).
pub const DEFAULT_SIM_MAX_LEVEL: u8 = 6;

#[derive(Debug, Clone)]
pub struct SchedulerSection {
    pub max_concurrent: usize,
}

#[derive(Debug, Clone)]
pub struct RefinementSection {
    pub sse_threshold: f64,
    pub max_level: u8,
    pub retained_budget: usize,
}

#[derive(Debug, Clone)]
pub struct SimulationSection {
    pub cycles: u64,
    pub frame_ms: u64,
    pub viewport_width: u32,
    pub viewport_height: u32,
    pub fetch_latency_ms: u64,
    /// Inject a transient fetch failure every Nth fetch; 0 disables.
    pub fail_every: u64,
}

/// Parsed configuration with defaults applied.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub scheduler: SchedulerSection,
    pub refinement: RefinementSection,
    pub simulation: SimulationSection,
}

impl Default for ConfigFile {
    fn default() -> Self {
        let refinement = RefinementConfig::default();
        Self {
            scheduler: SchedulerSection {
                max_concurrent: SchedulerConfig::default().max_concurrent,
            },
            refinement: RefinementSection {
                sse_threshold: refinement.sse_threshold,
                max_level: DEFAULT_SIM_MAX_LEVEL,
                retained_budget: refinement.retained_budget,
            },
            simulation: SimulationSection {
                cycles: DEFAULT_CYCLES,
                frame_ms: DEFAULT_FRAME_MS,
                viewport_width: 800,
                viewport_height: 600,
                fetch_latency_ms: DEFAULT_FETCH_LATENCY_MS,
                fail_every: 0,
            },
        }
    }
}

impl ConfigFile {
    /// Default location: `<platform config dir>/tilescape/config.ini`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tilescape").join("config.ini"))
    }

    /// Loads the config from `path`, the default location, or defaults if
    /// no file exists.
    pub fn load(path: Option<&Path>) -> io::Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => {
                    debug!("No config file; using defaults");
                    return Ok(Self::default());
                }
            },
        };
        let ini = Ini::load_from_file(&path)
            .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error.to_string()))?;
        debug!(path = %path.display(), "Loaded config file");
        Ok(Self::from_ini(&ini))
    }

    fn from_ini(ini: &Ini) -> Self {
        let mut config = Self::default();
        if let Some(value) = get(ini, "scheduler", "max_concurrent") {
            config.scheduler.max_concurrent = value;
        }
        if let Some(value) = get(ini, "refinement", "sse_threshold") {
            config.refinement.sse_threshold = value;
        }
        if let Some(value) = get(ini, "refinement", "max_level") {
            config.refinement.max_level = value;
        }
        if let Some(value) = get(ini, "refinement", "retained_budget") {
            config.refinement.retained_budget = value;
        }
        if let Some(value) = get(ini, "simulation", "cycles") {
            config.simulation.cycles = value;
        }
        if let Some(value) = get(ini, "simulation", "frame_ms") {
            config.simulation.frame_ms = value;
        }
        if let Some(value) = get(ini, "simulation", "viewport_width") {
            config.simulation.viewport_width = value;
        }
        if let Some(value) = get(ini, "simulation", "viewport_height") {
            config.simulation.viewport_height = value;
        }
        if let Some(value) = get(ini, "simulation", "fetch_latency_ms") {
            config.simulation.fetch_latency_ms = value;
        }
        if let Some(value) = get(ini, "simulation", "fail_every") {
            config.simulation.fail_every = value;
        }
        config
    }

    /// Library scheduler configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent: self.scheduler.max_concurrent,
        }
    }

    /// Library refinement configuration.
    pub fn refinement_config(&self) -> RefinementConfig {
        RefinementConfig::default()
            .with_sse_threshold(self.refinement.sse_threshold)
            .with_max_level(self.refinement.max_level)
            .with_retained_budget(self.refinement.retained_budget)
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.simulation.frame_ms)
    }
}

/// Reads and parses one INI key, ignoring unparsable values.
fn get<T: std::str::FromStr>(ini: &Ini, section: &str, key: &str) -> Option<T> {
    ini.get_from(Some(section), key)?.trim().parse().ok()
}
