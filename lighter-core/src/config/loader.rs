//! Layered config resolution.
//!
//! Sources merge in increasing precedence: earlier files, later files, `LIGHTER_*`
//! environment variables, then `key=value` command-line overrides. `@a.b.c` strings are then
//! replaced by the value at that path of the merged tree.

use super::{ConfigSchema, PROHIBITED_ARGS, TOP_LEVEL_KEYS};
use crate::error::{ConfigError, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default environment prefix. `LIGHTER_TRAINER__MAX_EPOCHS=3` sets `trainer.max_epochs`.
pub const ENV_PREFIX: &str = "LIGHTER_";

const REFERENCE_MARKER: char = '@';

/// A config merged from every source, with references resolved.
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema: ConfigSchema,
    /// The merged tree the schema was extracted from.
    pub tree: Value,
}

/// Collects config sources and resolves them into a [`ResolvedConfig`].
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    files: Vec<PathBuf>,
    overrides: Vec<String>,
    env_prefix: Option<String>,
}

impl Default for ConfigResolver {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            overrides: Vec::new(),
            env_prefix: Some(ENV_PREFIX.to_string()),
        }
    }
}

impl ConfigResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file(mut self, path: impl Into<PathBuf>) -> Self {
        self.files.push(path.into());
        self
    }

    pub fn files<I, P>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.files.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Add one `key=value` override. Keys use `.` or `#` as separators.
    pub fn override_arg(mut self, raw: impl Into<String>) -> Self {
        self.overrides.push(raw.into());
        self
    }

    pub fn overrides<I, S>(mut self, raws: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.overrides.extend(raws.into_iter().map(Into::into));
        self
    }

    /// Read environment variables with this prefix, or none at all.
    pub fn env_prefix(mut self, prefix: Option<&str>) -> Self {
        self.env_prefix = prefix.map(str::to_string);
        self
    }

    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let mut project_source: Option<String> = None;
        let mut figment = Figment::new();

        for path in &self.files {
            let content = read_source(path)?;
            if declares_project(path, &content)? {
                claim_project(&mut project_source, path.display().to_string())?;
            }
            if !content.trim().is_empty() {
                figment = figment.merge(Yaml::string(&content));
            }
            debug!(path = %path.display(), "merged config file");
        }

        if let Some(prefix) = &self.env_prefix {
            let env = Env::prefixed(prefix)
                .filter(|key| {
                    let head = key.as_str().split("__").next().unwrap_or_default();
                    TOP_LEVEL_KEYS.iter().any(|k| head.eq_ignore_ascii_case(k))
                })
                .split("__");
            if env.iter().any(|(key, _)| is_project_key(key.as_str())) {
                claim_project(&mut project_source, "environment".to_string())?;
            }
            figment = figment.merge(env);
        }

        for raw in &self.overrides {
            let (key, value) = parse_override(raw)?;
            if is_project_key(&key) {
                claim_project(&mut project_source, "command line".to_string())?;
            }
            debug!(%key, "applying override");
            figment = figment.merge(Serialized::default(&key, value));
        }

        let merged: Value = figment.extract().map_err(ConfigError::from)?;
        let tree = resolve_references(&merged)?;

        check_top_level(&tree)?;
        let schema: ConfigSchema =
            serde_json::from_value(tree.clone()).map_err(|e| ConfigError::parse(e.to_string()))?;
        check_prohibited_args(&schema)?;

        Ok(ResolvedConfig { schema, tree })
    }
}

fn read_source(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        ConfigError::parse(format!("cannot read '{}': {e}", path.display())).into()
    })
}

/// Whether a YAML document declares `project` at its top level.
fn declares_project(path: &Path, content: &str) -> Result<bool> {
    let doc: serde_yaml::Value = serde_yaml::from_str(content)
        .map_err(|e| ConfigError::parse(format!("{}: {e}", path.display())))?;
    Ok(match doc {
        serde_yaml::Value::Mapping(map) => map.contains_key("project"),
        serde_yaml::Value::Null => false,
        _ => {
            return Err(ConfigError::parse(format!(
                "{}: top level must be a mapping",
                path.display()
            ))
            .into());
        }
    })
}

/// `project` itself or a dotted key below it.
fn is_project_key(key: &str) -> bool {
    let head = key.split('.').next().unwrap_or_default();
    head.eq_ignore_ascii_case("project")
}

fn claim_project(current: &mut Option<String>, source: String) -> Result<()> {
    match current {
        Some(first) => Err(ConfigError::DuplicateProject {
            first: first.clone(),
            second: source,
        }
        .into()),
        None => {
            *current = Some(source);
            Ok(())
        }
    }
}

/// Split `a.b=1` (or `a#b=1`) into a dotted key and a YAML-parsed value.
pub fn parse_override(raw: &str) -> Result<(String, Value)> {
    let invalid = || ConfigError::InvalidOverride {
        raw: raw.to_string(),
    };
    let (key, value) = raw.split_once('=').ok_or_else(invalid)?;
    let key = key.trim().replace('#', ".");
    if key.is_empty() || key.split('.').any(str::is_empty) {
        return Err(invalid().into());
    }
    let value = match serde_yaml::from_str::<serde_yaml::Value>(value) {
        Ok(yaml) => serde_json::to_value(yaml).unwrap_or_else(|_| Value::String(value.to_string())),
        Err(_) => Value::String(value.to_string()),
    };
    Ok((key, value))
}

/// Replace every `@path` string in `root` with the (resolved) value it points to.
pub fn resolve_references(root: &Value) -> Result<Value> {
    let mut stack = Vec::new();
    resolve_value(root, root, "", &mut stack)
}

fn resolve_value(root: &Value, value: &Value, key: &str, stack: &mut Vec<String>) -> Result<Value> {
    match value {
        Value::String(s) => match s.strip_prefix(REFERENCE_MARKER) {
            Some(reference) if !reference.is_empty() => {
                resolve_reference(root, reference, key, stack)
            }
            _ => Ok(value.clone()),
        },
        Value::Object(map) => {
            let mut resolved = serde_json::Map::new();
            for (k, v) in map {
                let child = join_key(key, k);
                resolved.insert(k.clone(), resolve_value(root, v, &child, stack)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| resolve_value(root, v, &join_key(key, &i.to_string()), stack))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        _ => Ok(value.clone()),
    }
}

fn resolve_reference(
    root: &Value,
    reference: &str,
    key: &str,
    stack: &mut Vec<String>,
) -> Result<Value> {
    let path = reference.replace('#', ".");
    if stack.contains(&path) {
        return Err(ConfigError::CircularReference {
            reference: reference.to_string(),
        }
        .into());
    }
    let target = lookup_path(root, &path).ok_or_else(|| ConfigError::UnresolvedReference {
        key: key.to_string(),
        reference: reference.to_string(),
    })?;
    stack.push(path.clone());
    let resolved = resolve_value(root, target, &path, stack);
    stack.pop();
    resolved
}

fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn join_key(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}

fn check_top_level(tree: &Value) -> Result<()> {
    if let Value::Object(map) = tree {
        if let Some(key) = map.keys().find(|k| !TOP_LEVEL_KEYS.contains(&k.as_str())) {
            return Err(ConfigError::UnknownKey { key: key.clone() }.into());
        }
    }
    Ok(())
}

fn check_prohibited_args(schema: &ConfigSchema) -> Result<()> {
    for (field, args) in schema.args.sections() {
        let keys: Vec<String> = args
            .keys()
            .filter(|k| PROHIBITED_ARGS.contains(&k.as_str()))
            .cloned()
            .collect();
        if !keys.is_empty() {
            return Err(ConfigError::ProhibitedArgs {
                field: field.to_string(),
                keys,
            }
            .into());
        }
    }
    Ok(())
}
