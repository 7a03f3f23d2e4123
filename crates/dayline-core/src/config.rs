use std::collections::HashMap;
use std::fs;
use std::path::{
  Path,
  PathBuf
};
use std::time::Duration;

use anyhow::{
  Context,
  anyhow
};
use chrono::NaiveTime;
use tracing::{
  debug,
  info,
  trace,
  warn
};

use crate::reschedule::ReschedulePolicy;
use crate::sync::SyncSettings;

const RC_ENV_VAR: &str = "DAYLINERC";

const DEFAULTS: [(&str, &str); 9] = [
  ("data.location", "~/.dayline"),
  ("default.command", "agenda"),
  ("color", "on"),
  ("horizon.months", "12"),
  ("sync.settle_ms", "300"),
  ("sync.retry_ms", "500"),
  ("sync.retries", "1"),
  ("reschedule.neutral_time", "12:00"),
  ("reschedule.upcoming_days", "2")
];

#[derive(Debug, Clone)]
pub struct Config {
  map: HashMap<String, String>,
  pub loaded_files: Vec<PathBuf>
}

impl Default for Config {
  fn default() -> Self {
    Self {
      map:          DEFAULTS
        .iter()
        .map(|(k, v)| {
          (k.to_string(), v.to_string())
        })
        .collect(),
      loaded_files: vec![]
    }
  }
}

impl Config {
  #[tracing::instrument(skip(
    rc_override
  ))]
  pub fn load(
    rc_override: Option<&Path>
  ) -> anyhow::Result<Self> {
    let mut cfg = Config::default();

    let rc = resolve_rc_path(
      rc_override
    )?;
    if let Some(path) = rc {
      info!(rc = %path.display(), "loading daylinerc");
      cfg.load_file(&path)?;
    } else {
      warn!(
        "no daylinerc found; using \
         defaults"
      );
    }

    Ok(cfg)
  }

  #[tracing::instrument(skip(
    self, overrides
  ))]
  pub fn apply_overrides<I>(
    &mut self,
    overrides: I
  ) where
    I: IntoIterator<
      Item = (String, String)
    >
  {
    for (k, v) in overrides {
      let key = k
        .strip_prefix("rc.")
        .unwrap_or(&k)
        .to_string();
      debug!(key = %key, value = %v, "applying override");
      self.map.insert(key, v);
    }
  }

  pub fn get(
    &self,
    key: &str
  ) -> Option<String> {
    self.map.get(key).cloned()
  }

  pub fn get_bool(
    &self,
    key: &str
  ) -> anyhow::Result<Option<bool>> {
    self
      .map
      .get(key)
      .map(|raw| {
        parse_bool(raw).ok_or_else(|| {
          anyhow!(
            "config key {key} must be \
             on or off, got '{raw}'"
          )
        })
      })
      .transpose()
  }

  pub fn get_u32(
    &self,
    key: &str
  ) -> anyhow::Result<Option<u32>> {
    self
      .map
      .get(key)
      .map(|raw| {
        raw.trim().parse::<u32>().with_context(|| {
          format!(
            "config key {key} must be \
             a non-negative integer, \
             got '{raw}'"
          )
        })
      })
      .transpose()
  }

  pub fn get_time(
    &self,
    key: &str
  ) -> anyhow::Result<Option<NaiveTime>>
  {
    self
      .map
      .get(key)
      .map(|raw| {
        NaiveTime::parse_from_str(
          raw.trim(),
          "%H:%M"
        )
        .with_context(|| {
          format!(
            "config key {key} must be \
             HH:MM, got '{raw}'"
          )
        })
      })
      .transpose()
  }

  #[tracing::instrument(skip(self))]
  fn load_file(
    &mut self,
    path: &Path
  ) -> anyhow::Result<()> {
    let path = expand_tilde(path);
    let text =
      fs::read_to_string(&path)
        .with_context(|| {
          format!(
            "failed to read {}",
            path.display()
          )
        })?;

    self
      .loaded_files
      .push(path.clone());

    let base_dir = path
      .parent()
      .map(|p| p.to_path_buf())
      .unwrap_or_else(|| {
        PathBuf::from(".")
      });

    for (line_num, raw_line) in
      text.lines().enumerate()
    {
      let mut line = raw_line.trim();
      if line.is_empty()
        || line.starts_with('#')
      {
        continue;
      }

      if let Some((before, _)) =
        line.split_once('#')
      {
        line = before.trim();
      }

      if line.is_empty() {
        continue;
      }

      if let Some(include_rest) =
        line.strip_prefix("include ")
      {
        let include_path =
          resolve_include_path(
            &base_dir,
            include_rest.trim()
          )?;
        debug!(
            file = %path.display(),
            include = %include_path.display(),
            line = line_num + 1,
            "processing include"
        );

        if include_path.exists() {
          self
            .load_file(&include_path)?;
        } else {
          warn!(include = %include_path.display(), "include file does not exist; skipping");
        }
        continue;
      }

      let (k, v) = line
        .split_once('=')
        .ok_or_else(|| {
          anyhow!(
            "invalid config line \
             {}:{}: {}",
            path.display(),
            line_num + 1,
            raw_line
          )
        })?;

      let key = k.trim().to_string();
      let value = v.trim().to_string();
      trace!(key = %key, value = %value, "loaded config key");
      self.map.insert(key, value);
    }

    Ok(())
  }
}

/// Typed view of the engine-related keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
  pub horizon_months: u32,
  pub sync:           SyncSettings,
  pub reschedule:     ReschedulePolicy
}

impl Default for EngineSettings {
  fn default() -> Self {
    Self {
      horizon_months: 12,
      sync:           SyncSettings::default(),
      reschedule:
        ReschedulePolicy::default()
    }
  }
}

impl EngineSettings {
  #[tracing::instrument(skip(cfg))]
  pub fn from_config(
    cfg: &Config
  ) -> anyhow::Result<Self> {
    let defaults = Self::default();

    let horizon_months = cfg
      .get_u32("horizon.months")?
      .unwrap_or(defaults.horizon_months);
    if horizon_months == 0 {
      return Err(anyhow!(
        "config key horizon.months \
         must be at least 1"
      ));
    }

    let millis = |key: &str,
                  fallback: Duration|
     -> anyhow::Result<Duration> {
      Ok(
        cfg
          .get_u32(key)?
          .map(|ms| {
            Duration::from_millis(
              u64::from(ms)
            )
          })
          .unwrap_or(fallback)
      )
    };

    let sync = SyncSettings {
      settle_delay: millis(
        "sync.settle_ms",
        defaults.sync.settle_delay
      )?,
      retry_delay:  millis(
        "sync.retry_ms",
        defaults.sync.retry_delay
      )?,
      retries:      cfg
        .get_u32("sync.retries")?
        .unwrap_or(
          defaults.sync.retries
        )
    };

    let upcoming_days = cfg
      .get_u32(
        "reschedule.upcoming_days"
      )?
      .unwrap_or(
        defaults.reschedule.upcoming_days
      );
    if upcoming_days < 2 {
      return Err(anyhow!(
        "config key \
         reschedule.upcoming_days must \
         be at least 2, got \
         {upcoming_days}"
      ));
    }

    let reschedule = ReschedulePolicy {
      neutral_time: cfg
        .get_time(
          "reschedule.neutral_time"
        )?
        .unwrap_or(
          defaults
            .reschedule
            .neutral_time
        ),
      upcoming_days
    };

    let settings = Self {
      horizon_months,
      sync,
      reschedule
    };
    debug!(?settings, "resolved engine settings");
    Ok(settings)
  }
}

#[tracing::instrument(skip(
  cfg,
  override_dir
))]
pub fn resolve_data_dir(
  cfg: &Config,
  override_dir: Option<&Path>
) -> anyhow::Result<PathBuf> {
  let dir = if let Some(path) =
    override_dir
  {
    path.to_path_buf()
  } else if let Some(cfg_value) =
    cfg.get("data.location")
  {
    expand_tilde(Path::new(&cfg_value))
  } else {
    default_data_dir()?
  };

  if !dir.exists() {
    info!(dir = %dir.display(), "creating data directory");
    fs::create_dir_all(&dir)
      .with_context(|| {
        format!(
          "failed to create {}",
          dir.display()
        )
      })?;
  }

  Ok(dir)
}

#[tracing::instrument(skip(
  override_path
))]
fn resolve_rc_path(
  override_path: Option<&Path>
) -> anyhow::Result<Option<PathBuf>> {
  if let Some(path) = override_path {
    return Ok(Some(path.to_path_buf()));
  }

  if let Ok(rc_env) =
    std::env::var(RC_ENV_VAR)
  {
    if rc_env == "/dev/null" {
      return Ok(None);
    }
    return Ok(Some(PathBuf::from(
      rc_env
    )));
  }

  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  let candidate =
    home.join(".daylinerc");
  if candidate.exists() {
    return Ok(Some(candidate));
  }

  Ok(None)
}

fn default_data_dir()
-> anyhow::Result<PathBuf> {
  let home = dirs::home_dir()
    .ok_or_else(|| {
      anyhow!(
        "cannot determine home \
         directory"
      )
    })?;
  Ok(home.join(".dayline"))
}

fn resolve_include_path(
  base_dir: &Path,
  include: &str
) -> anyhow::Result<PathBuf> {
  if include.trim().is_empty() {
    return Err(anyhow!(
      "include path cannot be empty"
    ));
  }

  let raw = PathBuf::from(include);
  let expanded = expand_tilde(&raw);
  if expanded.is_absolute() {
    Ok(expanded)
  } else {
    Ok(base_dir.join(expanded))
  }
}

fn expand_tilde(
  path: &Path
) -> PathBuf {
  let text = path.to_string_lossy();
  if let Some(rest) =
    text.strip_prefix("~/")
    && let Some(home) = dirs::home_dir()
  {
    return home.join(rest);
  }
  path.to_path_buf()
}

fn parse_bool(s: &str) -> Option<bool> {
  match s.trim().to_ascii_lowercase().as_str()
  {
    | "1" | "y" | "yes" | "on" | "true" => {
      Some(true)
    }
    | "0" | "n" | "no" | "off"
    | "false" => Some(false),
    | _ => None
  }
}
