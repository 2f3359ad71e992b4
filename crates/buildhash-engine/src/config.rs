//! Engine configuration: four root directories plus the shared `db_root`
//! they template against (spec §4.H, §6).

use std::collections::HashMap;
use std::fs;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use buildhash_fs::Roots;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config template did not converge after {0} passes (cycle among {{...}} references?)")]
    TemplateCycle(u32),
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

const MAX_EXPANSION_PASSES: u32 = 16;

/// Raw, not-yet-expanded configuration. Each field may reference another
/// by name with `{field}` syntax (e.g. the default `cas_root` is
/// `"{db_root}/cas"`), matching the Python prototype's `config.py`
/// (`config[k] = config[k].format(**config)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_root: String,
    pub src_root: String,
    pub gen_root: String,
    pub cas_root: String,
    pub out_root: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            db_root: "build-files".to_string(),
            src_root: "{db_root}/src".to_string(),
            gen_root: "{db_root}/gen".to_string(),
            cas_root: "{db_root}/cas".to_string(),
            out_root: "{db_root}/out".to_string(),
        }
    }
}

impl Config {
    /// Load a config from a TOML file, falling back to [`Config::default`]
    /// for any field the file omits.
    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Apply `overrides` on top of this config's values (an override of
    /// the empty string is treated as "not set").
    #[must_use]
    pub fn with_overrides(mut self, overrides: &HashMap<String, String>) -> Self {
        for (key, value) in overrides {
            match key.as_str() {
                "db_root" => self.db_root = value.clone(),
                "src_root" => self.src_root = value.clone(),
                "gen_root" => self.gen_root = value.clone(),
                "cas_root" => self.cas_root = value.clone(),
                "out_root" => self.out_root = value.clone(),
                _ => {}
            }
        }
        self
    }

    /// Expand `{field}`-style mutual references to a fixed point, then
    /// create the writable roots (`gen_root`, `cas_root`, `out_root`) —
    /// `src_root` is read-only input and is never created by the engine.
    pub fn resolve(&self) -> Result<Roots, ConfigError> {
        let mut vars: HashMap<&str, String> = HashMap::from([
            ("db_root", self.db_root.clone()),
            ("src_root", self.src_root.clone()),
            ("gen_root", self.gen_root.clone()),
            ("cas_root", self.cas_root.clone()),
            ("out_root", self.out_root.clone()),
        ]);

        for _ in 0..MAX_EXPANSION_PASSES {
            let snapshot = vars.clone();
            let mut changed = false;
            for value in vars.values_mut() {
                let expanded = expand_once(value, &snapshot);
                if expanded != *value {
                    *value = expanded;
                    changed = true;
                }
            }
            if !changed {
                // A mutual cycle (e.g. db_root="{cas_root}", cas_root="{db_root}")
                // collapses to a self-reference after one pass and then reports
                // `changed = false` forever after, since each field already
                // equals its own fixed point. Catch that here: any known field
                // name still present in `{...}` form never resolved to a
                // literal and must not be materialized as a literal directory
                // name.
                let known_fields = ["db_root", "src_root", "gen_root", "cas_root", "out_root"];
                for value in vars.values() {
                    if known_fields.iter().any(|f| value.contains(&format!("{{{f}}}"))) {
                        return Err(ConfigError::TemplateCycle(MAX_EXPANSION_PASSES));
                    }
                }
                let roots = Roots {
                    src_root: vars["src_root"].clone().into(),
                    gen_root: vars["gen_root"].clone().into(),
                    cas_root: vars["cas_root"].clone().into(),
                    out_root: vars["out_root"].clone().into(),
                };
                for (path, label) in [
                    (&roots.gen_root, "gen_root"),
                    (&roots.cas_root, "cas_root"),
                    (&roots.out_root, "out_root"),
                ] {
                    fs::create_dir_all(path).map_err(|source| ConfigError::CreateDir {
                        path: format!("{label}={}", path.display()),
                        source,
                    })?;
                }
                return Ok(roots);
            }
        }
        Err(ConfigError::TemplateCycle(MAX_EXPANSION_PASSES))
    }
}

/// Replace every `{key}` occurrence in `template` with `vars[key]`,
/// leaving unresolvable references untouched (caught by the caller's
/// fixed-point convergence check).
fn expand_once(template: &str, vars: &HashMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 1..];
        match after_open.find('}') {
            Some(close) => {
                let key = &after_open[..close];
                match vars.get(key) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(key);
                        out.push('}');
                    }
                }
                rest = &after_open[close + 1..];
            }
            None => {
                out.push('{');
                rest = after_open;
            }
        }
    }
    out.push_str(rest);
    out
}
