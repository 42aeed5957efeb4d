//! Name transformer.
//!
//! Maps a logical group name to its per-backend canonical name through an
//! ordered list of `{input regex, output template}` pairs keyed by backend
//! type, with a `default` wildcard set. The first matching pair applies;
//! capture groups expand into the template (`$1`, `${name}`). Regexes are
//! compiled once at config load.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use regex::Regex;

use crate::config::PatternPair;

/// The wildcard key applied when a backend type has no pattern set of its
/// own.
pub const DEFAULT_PATTERN_KEY: &str = "default";

struct CompiledPattern {
    input: Regex,
    output: String,
}

/// Compiled pattern sets, keyed by backend type.
pub struct NameTransformer {
    patterns: HashMap<String, Vec<CompiledPattern>>,
}

impl NameTransformer {
    /// Compile the configured pattern map. An empty map is legal; every
    /// transform then fails with "no matching pattern found".
    pub fn from_config(config: &HashMap<String, Vec<PatternPair>>) -> Result<Self> {
        let mut patterns = HashMap::with_capacity(config.len());
        for (backend_type, pairs) in config {
            let mut compiled = Vec::with_capacity(pairs.len());
            for pair in pairs {
                // anchor so a pair applies only when it matches the whole
                // logical name
                let input = Regex::new(&format!("^(?:{})$", pair.input)).with_context(|| {
                    format!(
                        "invalid pattern for backend type {backend_type}: {}",
                        pair.input
                    )
                })?;
                compiled.push(CompiledPattern {
                    input,
                    output: pair.output.to_owned(),
                });
            }
            patterns.insert(backend_type.to_owned(), compiled);
        }
        Ok(Self { patterns })
    }

    /// Transform a logical name for one backend type. The type's own
    /// pattern set wins over `default`; within a set the first match
    /// wins. The regex must match the full logical name.
    pub fn transform(&self, backend_type: &str, logical_name: &str) -> Result<String> {
        let pairs = self
            .patterns
            .get(backend_type)
            .or_else(|| self.patterns.get(DEFAULT_PATTERN_KEY));

        if let Some(pairs) = pairs {
            for pair in pairs {
                if let Some(caps) = pair.input.captures(logical_name) {
                    let mut out = String::new();
                    caps.expand(&pair.output, &mut out);
                    return Ok(out);
                }
            }
        }
        bail!("no matching pattern found for {backend_type}/{logical_name}")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn transformer() -> NameTransformer {
        let config: HashMap<String, Vec<PatternPair>> = [
            (
                "snowflake".to_owned(),
                vec![
                    PatternPair {
                        input: "team-(.*)".to_owned(),
                        output: "env_${1}_team".to_owned(),
                    },
                    PatternPair {
                        input: "(.*)".to_owned(),
                        output: "${1}_role".to_owned(),
                    },
                ],
            ),
            (
                "default".to_owned(),
                vec![PatternPair {
                    input: "([a-z0-9-]+)".to_owned(),
                    output: "$1".to_owned(),
                }],
            ),
        ]
        .into();
        NameTransformer::from_config(&config).unwrap()
    }

    #[test]
    fn first_matching_pair_wins() -> Result<()> {
        let t = transformer();
        assert_eq!(t.transform("snowflake", "team-prod")?, "env_prod_team");
        // second pair catches what the first does not
        assert_eq!(t.transform("snowflake", "analysts")?, "analysts_role");
        Ok(())
    }

    #[test]
    fn unknown_type_falls_back_to_default() -> Result<()> {
        let t = transformer();
        assert_eq!(t.transform("fivetran", "data-team")?, "data-team");
        Ok(())
    }

    #[test]
    fn no_match_is_an_error() {
        let t = transformer();
        // uppercase never matches the default pattern
        let err = t.transform("fivetran", "DATA").unwrap_err();
        assert!(err.to_string().contains("no matching pattern found"));
    }

    #[test]
    fn match_must_cover_the_whole_name() {
        let config: HashMap<String, Vec<PatternPair>> = [(
            "default".to_owned(),
            vec![PatternPair {
                input: "team".to_owned(),
                output: "t".to_owned(),
            }],
        )]
        .into();
        let t = NameTransformer::from_config(&config).unwrap();
        assert!(t.transform("fivetran", "team-extra").is_err());
        assert_eq!(t.transform("fivetran", "team").unwrap(), "t");
    }

    #[test]
    fn invalid_regex_fails_at_load() {
        let config: HashMap<String, Vec<PatternPair>> = [(
            "default".to_owned(),
            vec![PatternPair {
                input: "(".to_owned(),
                output: "x".to_owned(),
            }],
        )]
        .into();
        assert!(NameTransformer::from_config(&config).is_err());
    }
}
