// config.rs - snapzones daemon configuration
//
// Config is loaded from ~/.config/snapzones/*.conf (or $SNAPZONES_CONFIG_DIR),
// files in sorted order, later keys overriding earlier ones. Same
// key = value / section { } syntax as the rest of the desktop, `#` comments,
// `source = <path>` includes.
//
//   general {
//     default_layout = <layout id>
//     autotile = true
//     data_dir = ~/.local/share/snapzones
//     persistence_timeout_ms = 5000
//     refresh_coalesce_ms = 50
//   }
//   autotile {
//     algorithm = master_stack | columns | bsp
//     split_ratio = 0.6
//     master_count = 1
//     inner_gap = 8
//     outer_gap = 8
//     max_windows = 6
//     insert_position = end | start | after_focused
//   }
//
// Every line is first parsed into a `GeneralSetting` / `AutotileSetting`
// value; only well-formed values reach `Settings`. The loaded snapshot is
// immutable and shared as `Arc<Settings>`.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::assignment::LayoutId;
use crate::tiling::{InsertPosition, TilingAlgorithm, TilingParams};
use crate::util::{expand_tilde, resolve_path, strip_comment, xdg_dir};

// ── top-level ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub general: GeneralConfig,
    /// Parameters for autotile layouts that do not carry their own.
    pub autotile: TilingParams,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneralConfig {
    /// Resolution fallback after every explicit entry.
    pub default_layout: Option<LayoutId>,
    pub autotile: bool,
    pub data_dir: PathBuf,
    pub persistence_timeout: Duration,
    pub refresh_coalesce: Duration,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_layout: None,
            autotile: true,
            data_dir: xdg_dir("XDG_DATA_HOME", ".local/share").join("snapzones"),
            persistence_timeout: crate::persistence::DEFAULT_TIMEOUT,
            refresh_coalesce: crate::coalesce::DEFAULT_INTERVAL,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            autotile: TilingParams::default(),
        }
    }
}

// ── typed settings ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum GeneralSetting {
    DefaultLayout(Option<LayoutId>),
    Autotile(bool),
    DataDir(PathBuf),
    PersistenceTimeout(Duration),
    RefreshCoalesce(Duration),
}

impl GeneralSetting {
    pub fn parse(key: &str, value: &str, file: &Path) -> Result<Self, String> {
        let value = value.trim();
        Ok(match key {
            "default_layout" => {
                Self::DefaultLayout((!value.is_empty() && value != "none").then(|| LayoutId::new(value)))
            }
            "autotile" => Self::Autotile(parse_bool(value).ok_or_else(|| format!("bad bool `{value}`"))?),
            "data_dir" => Self::DataDir(resolve_path(value, file)),
            "persistence_timeout_ms" => Self::PersistenceTimeout(parse_millis(value)?),
            "refresh_coalesce_ms" => Self::RefreshCoalesce(parse_millis(value)?),
            _ => return Err(format!("unknown general.{key}")),
        })
    }

    pub fn apply(self, g: &mut GeneralConfig) {
        match self {
            Self::DefaultLayout(id) => g.default_layout = id,
            Self::Autotile(b) => g.autotile = b,
            Self::DataDir(p) => g.data_dir = p,
            Self::PersistenceTimeout(d) => g.persistence_timeout = d,
            Self::RefreshCoalesce(d) => g.refresh_coalesce = d,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AutotileSetting {
    Algorithm(TilingAlgorithm),
    SplitRatio(f64),
    MasterCount(u32),
    InnerGap(u32),
    OuterGap(u32),
    MaxWindows(u32),
    InsertPosition(InsertPosition),
}

impl AutotileSetting {
    pub fn parse(key: &str, value: &str) -> Result<Self, String> {
        let value = value.trim();
        let uint = || value.parse::<u32>().map_err(|_| format!("bad {key} `{value}`"));
        Ok(match key {
            "algorithm" => Self::Algorithm(
                TilingAlgorithm::parse(value).ok_or_else(|| format!("unknown algorithm `{value}`"))?,
            ),
            "split_ratio" => Self::SplitRatio(
                value
                    .parse::<f64>()
                    .map_err(|_| format!("bad split_ratio `{value}`"))?,
            ),
            "master_count" => Self::MasterCount(uint()?),
            "inner_gap" => Self::InnerGap(uint()?),
            "outer_gap" => Self::OuterGap(uint()?),
            "max_windows" => Self::MaxWindows(uint()?),
            "insert_position" => Self::InsertPosition(
                InsertPosition::parse(value).ok_or_else(|| format!("unknown insert_position `{value}`"))?,
            ),
            _ => return Err(format!("unknown autotile.{key}")),
        })
    }

    /// Out-of-range numbers are stored as given; `Settings` clamps once at
    /// the end of loading.
    pub fn apply(self, p: &mut TilingParams) {
        match self {
            Self::Algorithm(a) => p.algorithm = a,
            Self::SplitRatio(r) => p.split_ratio = r,
            Self::MasterCount(n) => p.master_count = n,
            Self::InnerGap(n) => p.inner_gap = n,
            Self::OuterGap(n) => p.outer_gap = n,
            Self::MaxWindows(n) => p.max_windows = n,
            Self::InsertPosition(i) => p.insert_position = i,
        }
    }
}

// ── loading ───────────────────────────────────────────────────────────────────

impl Settings {
    pub fn load() -> Arc<Self> {
        Arc::new(Self::load_from(&Self::config_dir()))
    }

    pub fn load_from(dir: &Path) -> Self {
        tracing::info!("Config dir: {}", dir.display());

        let mut paths: Vec<PathBuf> = match std::fs::read_dir(dir) {
            Ok(rd) => rd
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("conf"))
                .collect(),
            Err(e) => {
                tracing::info!("Could not read config dir {}: {e}, using defaults", dir.display());
                return Self::default();
            }
        };
        paths.sort();

        let mut cfg = Self::default();
        for path in &paths {
            tracing::info!("Loading config: {}", path.display());
            let text = match std::fs::read_to_string(path) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!("Could not read {}: {e}", path.display());
                    continue;
                }
            };
            let mut stack = vec![path.canonicalize().unwrap_or_else(|_| path.clone())];
            if let Err(e) = parse_into(&text, path, &mut stack, &mut cfg) {
                tracing::warn!("Config error in {}: {e}", path.display());
            }
        }
        cfg.autotile = cfg.autotile.clamped();

        tracing::info!(
            "Config loaded: default_layout={:?} autotile={} algorithm={} data_dir={}",
            cfg.general.default_layout.as_ref().map(LayoutId::as_str),
            cfg.general.autotile,
            cfg.autotile.algorithm.label(),
            cfg.general.data_dir.display()
        );
        cfg
    }

    pub fn config_dir() -> PathBuf {
        if let Ok(p) = std::env::var("SNAPZONES_CONFIG_DIR") {
            return PathBuf::from(expand_tilde(&p));
        }
        xdg_dir("XDG_CONFIG_HOME", ".config").join("snapzones")
    }
}

// ── parser ────────────────────────────────────────────────────────────────────

fn parse_into(
    text: &str,
    file: &Path,
    stack: &mut Vec<PathBuf>,
    cfg: &mut Settings,
) -> Result<(), String> {
    let mut section_stack: Vec<String> = Vec::new();

    for (raw_no, raw_line) in text.lines().enumerate() {
        let lineno = raw_no + 1;
        let line = strip_comment(raw_line).trim();

        if line.is_empty() {
            continue;
        }

        if line.ends_with('{') {
            let name = line.trim_end_matches('{').trim().to_lowercase();
            section_stack.push(name);
            continue;
        }

        if line == "}" {
            section_stack
                .pop()
                .ok_or_else(|| format!("{}:{}: unexpected `}}`", file.display(), lineno))?;
            continue;
        }

        let (key, value) = split_kv(line).ok_or_else(|| {
            format!("{}:{}: expected `key = value`, got `{line}`", file.display(), lineno)
        })?;

        let section = section_stack.last().map(String::as_str).unwrap_or("");

        if key == "source" && section.is_empty() {
            let path = resolve_path(value, file);
            if !path.exists() {
                tracing::warn!(
                    "{}:{}: source `{}` not found (skipping)",
                    file.display(),
                    lineno,
                    path.display()
                );
                continue;
            }
            let canon = path.canonicalize().unwrap_or_else(|_| path.clone());
            if stack.contains(&canon) {
                return Err(format!("circular source: {}", path.display()));
            }
            let included = std::fs::read_to_string(&path)
                .map_err(|e| format!("cannot read source `{}`: {e}", path.display()))?;
            stack.push(canon);
            parse_into(&included, &path, stack, cfg)?;
            stack.pop();
            continue;
        }

        let applied = match section {
            // Flat files may put general keys at top level.
            "" | "general" => GeneralSetting::parse(key, value, file).map(|s| s.apply(&mut cfg.general)),
            "autotile" => AutotileSetting::parse(key, value).map(|s| s.apply(&mut cfg.autotile)),
            other => Err(format!("unknown section `{other}`")),
        };
        if let Err(e) = applied {
            tracing::warn!("{}:{}: {e}", file.display(), lineno);
        }
    }

    if !section_stack.is_empty() {
        return Err(format!(
            "{}: unclosed section(s): {}",
            file.display(),
            section_stack.join(" > ")
        ));
    }
    Ok(())
}

// ── primitive parsers ─────────────────────────────────────────────────────────

fn split_kv(line: &str) -> Option<(&str, &str)> {
    line.find('=')
        .map(|i| (line[..i].trim(), line[i + 1..].trim()))
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Some(true),
        "false" | "no" | "0" | "off" => Some(false),
        _ => None,
    }
}

fn parse_millis(s: &str) -> Result<Duration, String> {
    match s.trim().parse::<u64>() {
        Ok(0) => Err("duration must be at least 1 ms".into()),
        Ok(ms) => Ok(Duration::from_millis(ms)),
        Err(_) => Err(format!("bad milliseconds `{s}`")),
    }
}

// ── tests ─────────────────────────────────────────────────────────────────────
