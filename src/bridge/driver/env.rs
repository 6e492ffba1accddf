//! Environment binding resolution for launched backends.

use crate::config::EnvBinding;

/// Prefix of an indirect binding that reads the gateway's own environment.
const ENV_SOURCE_PREFIX: &str = "env:";

/// Resolve bindings into concrete `(name, value)` pairs.
///
/// A literal `value` wins over `valueFrom`. Indirect references that cannot be
/// resolved are omitted. `lookup` is the environment to read from.
pub fn resolve_env<F>(bindings: &[EnvBinding], lookup: F) -> Vec<(String, String)>
where
    F: Fn(&str) -> Option<String>,
{
    let mut resolved = Vec::with_capacity(bindings.len());
    for binding in bindings {
        if let Some(value) = &binding.value {
            resolved.push((binding.name.clone(), value.clone()));
            continue;
        }

        let Some(source) = binding.value_from.as_deref() else {
            continue;
        };
        let Some(var) = source.strip_prefix(ENV_SOURCE_PREFIX) else {
            tracing::debug!(name = %binding.name, source, "unsupported valueFrom source, skipping");
            continue;
        };
        match lookup(var) {
            Some(value) => resolved.push((binding.name.clone(), value)),
            None => tracing::debug!(name = %binding.name, var, "env reference not set, skipping"),
        }
    }
    resolved
}

/// Resolve against the process environment.
pub fn resolve_from_process(bindings: &[EnvBinding]) -> Vec<(String, String)> {
    resolve_env(bindings, |var| std::env::var(var).ok())
}

// ─── Tests ───────────────────────────────────────────────────────────────────
