//! Sandboxed sub-context evaluation
//!
//! Backs the script-facing `run_in_context(code, props)` global: the code
//! runs in a fresh engine with none of the host bindings, seeded only with
//! the enumerable string-keyed entries of `props`, each copied by value as a
//! string. The result is handed back stringified; an evaluation error is
//! stringified too rather than propagated.

use crate::config::EngineLimits;
use rhai::{Dynamic, Engine, Map, Scope};
use tracing::{debug, trace};

pub(crate) fn run_in_context(code: &str, props: &Map, limits: &EngineLimits) -> String {
    let mut engine = Engine::new();
    limits.apply(&mut engine);

    let mut scope = Scope::new();
    for (key, value) in props.iter() {
        trace!(key = %key, "seeding sandbox property");
        scope.push(key.to_string(), value.to_string());
    }

    match engine.eval_with_scope::<Dynamic>(&mut scope, code) {
        Ok(value) => value.to_string(),
        Err(err) => {
            debug!(error = %err, "sandboxed evaluation failed");
            err.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(entries: &[(&str, Dynamic)]) -> Map {
        entries
            .iter()
            .map(|(key, value)| ((*key).into(), value.clone()))
            .collect()
    }

    #[test]
    fn test_properties_are_seeded_as_strings() {
        let props = props(&[("a", Dynamic::from(1_i64)), ("b", Dynamic::from("2"))]);
        // Both values arrive as strings, so + concatenates.
        let result = run_in_context("a + b", &props, &EngineLimits::default());
        assert_eq!(result, "12");
    }

    #[test]
    fn test_result_is_stringified() {
        let result = run_in_context("21 * 2", &Map::new(), &EngineLimits::default());
        assert_eq!(result, "42");
    }

    #[test]
    fn test_errors_are_stringified_not_raised() {
        let result = run_in_context("no_such_fn()", &Map::new(), &EngineLimits::default());
        assert!(result.contains("no_such_fn"));
    }

    #[test]
    fn test_context_is_isolated() {
        // Nothing leaks between invocations.
        run_in_context("let leaked = 1; leaked", &Map::new(), &EngineLimits::default());
        let result = run_in_context("leaked", &Map::new(), &EngineLimits::default());
        assert!(result.contains("leaked"), "unseeded variable must not resolve");
    }
}
