//! Docker API query parameters.
//!
//! ferry implements a deliberately small subset of the build parameters.
//! Parameters it cannot honor are accepted only at the value the Docker CLI
//! sends when the feature is unused; anything else is rejected with a
//! message naming the parameter and value.

use std::collections::BTreeMap;

use ferry_core::{BuildOptions, FerryError, ResourceLimits, Result};
use serde::de::DeserializeOwned;

/// Default CFS period the Docker CLI assumes when only a quota is given.
const DEFAULT_CPU_PERIOD: u64 = 100_000;

/// Recognized parameters that must keep their neutral value.
const NEUTRAL_ONLY: &[(&str, &[&str])] = &[
    ("cgroupparent", &[""]),
    ("cpusetcpus", &[""]),
    ("cpusetmems", &[""]),
    ("cpushares", &["", "0"]),
    ("memswap", &["", "0", "-1"]),
    ("shmsize", &["", "0"]),
    ("ulimits", &["", "null", "[]"]),
    ("extrahosts", &[""]),
    ("remote", &[""]),
    ("platform", &[""]),
    ("outputs", &["", "null", "[]"]),
    ("squash", &["", "0", "false"]),
    ("networkmode", &["", "default"]),
    ("version", &["", "1", "2"]),
    ("rm", &["", "0", "1"]),
];

/// Parameters the CLI sends that have no effect on a ferry build.
const IGNORED: &[&str] = &["q", "forcerm", "pull", "session", "buildid", "isolation"];

/// Decoded query string, keeping repeated keys in order.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn parse(query: Option<&str>) -> Self {
        let pairs = query
            .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
            .unwrap_or_default();
        Self { pairs }
    }

    /// First value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First non-empty value of `name`.
    pub fn non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.pairs
            .iter()
            .filter(move |(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    fn pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Validated parameters of a build request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildParams {
    pub options: BuildOptions,
    pub limits: ResourceLimits,
}

impl BuildParams {
    /// Validate a build query. `defaults` is the envelope used when the
    /// request sets no CPU or memory limit.
    pub fn from_query(params: &QueryParams, defaults: ResourceLimits) -> Result<Self> {
        for (name, value) in params.pairs() {
            if let Some((_, allowed)) = NEUTRAL_ONLY.iter().find(|(n, _)| *n == name) {
                if !allowed.contains(&value) {
                    return Err(FerryError::invalid_parameter(
                        name,
                        value,
                        format!("only {} is supported", describe(allowed)),
                    ));
                }
            } else if IGNORED.contains(&name) {
                tracing::trace!(parameter = name, value, "Ignoring build parameter");
            } else if !is_handled(name) {
                tracing::debug!(parameter = name, value, "Unknown build parameter");
            }
        }

        let mut options = BuildOptions::new();
        if let Some(dockerfile) = params.non_empty("dockerfile") {
            options.dockerfile = dockerfile.to_string();
        }
        options.target = params.non_empty("target").map(str::to_string);
        options.no_cache = parse_flag(params, "nocache")?;

        if let Some(args) = parse_json::<BTreeMap<String, Option<String>>>(params, "buildargs")? {
            options.build_args = args
                .into_iter()
                .filter_map(|(key, value)| value.map(|v| (key, v)))
                .collect();
        }
        if let Some(labels) = parse_json::<BTreeMap<String, String>>(params, "labels")? {
            options.labels = labels;
        }
        if let Some(cache_from) = parse_json::<Vec<String>>(params, "cachefrom")? {
            if cache_from.len() > 1 {
                return Err(FerryError::invalid_parameter(
                    "cachefrom",
                    params.get("cachefrom").unwrap_or_default(),
                    "at most one cache source is supported",
                ));
            }
            options.cache_from = cache_from.into_iter().next();
        }
        options.tags = params
            .get_all("t")
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        let mut limits = defaults;
        let quota = parse_number(params, "cpuquota")?;
        let period = parse_number(params, "cpuperiod")?;
        if quota > 0 {
            let period = if period > 0 { period } else { DEFAULT_CPU_PERIOD };
            limits.cpu_millis = ResourceLimits::cpu_millis_from_quota(quota, period);
        }
        let memory = parse_number(params, "memory")?;
        if memory > 0 {
            limits.memory_bytes = memory;
        }

        Ok(Self { options, limits })
    }
}

fn is_handled(name: &str) -> bool {
    matches!(
        name,
        "t" | "dockerfile"
            | "target"
            | "nocache"
            | "buildargs"
            | "labels"
            | "cachefrom"
            | "cpuquota"
            | "cpuperiod"
            | "memory"
    )
}

fn describe(allowed: &[&str]) -> String {
    allowed
        .iter()
        .map(|v| if v.is_empty() { "an empty value".to_string() } else { format!("{:?}", v) })
        .collect::<Vec<_>>()
        .join(" or ")
}

fn parse_flag(params: &QueryParams, name: &str) -> Result<bool> {
    match params.get(name).unwrap_or_default() {
        "" | "0" | "false" => Ok(false),
        "1" | "true" => Ok(true),
        other => Err(FerryError::invalid_parameter(name, other, "expected 0 or 1")),
    }
}

fn parse_number(params: &QueryParams, name: &str) -> Result<u64> {
    match params.get(name).unwrap_or_default() {
        "" => Ok(0),
        value => value.parse().map_err(|_| {
            FerryError::invalid_parameter(name, value, "expected a non-negative integer")
        }),
    }
}

/// A JSON-encoded parameter; absent, empty and `null` all mean unset.
fn parse_json<T: DeserializeOwned>(params: &QueryParams, name: &str) -> Result<Option<T>> {
    match params.get(name).unwrap_or_default() {
        "" | "null" => Ok(None),
        value => serde_json::from_str::<T>(value)
            .map(Some)
            .map_err(|e| FerryError::invalid_parameter(name, value, e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(query: &str) -> Result<BuildParams> {
        BuildParams::from_query(&QueryParams::parse(Some(query)), ResourceLimits::build_default())
    }

    /// Query the Docker CLI sends for `docker build -t app:1 .` without BuildKit.
    const CLI_QUERY: &str = "buildargs=%7B%7D&cachefrom=%5B%5D&cgroupparent=&cpuperiod=0&cpuquota=0\
        &cpusetcpus=&cpusetmems=&cpushares=0&dockerfile=Dockerfile&labels=%7B%7D&memory=0\
        &memswap=0&networkmode=default&rm=1&shmsize=0&t=app%3A1&target=&ulimits=null&version=1";

    #[test]
    fn test_cli_defaults_accepted() {
        let params = build(CLI_QUERY).unwrap();
        assert_eq!(params.options.dockerfile, "Dockerfile");
        assert_eq!(params.options.tags, vec!["app:1".to_string()]);
        assert!(params.options.build_args.is_empty());
        assert_eq!(params.options.cache_from, None);
        assert_eq!(params.options.target, None);
        assert_eq!(params.limits, ResourceLimits::build_default());
    }

    #[test]
    fn test_build_args_labels_and_tags() {
        let params = build(
            "buildargs=%7B%22FOO%22%3A%22bar%22%2C%22UNSET%22%3Anull%7D\
             &labels=%7B%22team%22%3A%22infra%22%7D&t=myapp:latest&t=myapp:1&nocache=1&target=release",
        )
        .unwrap();
        assert_eq!(params.options.build_args.get("FOO").map(String::as_str), Some("bar"));
        assert!(!params.options.build_args.contains_key("UNSET"));
        assert_eq!(params.options.labels["team"], "infra");
        assert_eq!(params.options.tags, vec!["myapp:latest", "myapp:1"]);
        assert!(params.options.no_cache);
        assert_eq!(params.options.target.as_deref(), Some("release"));
    }

    #[test]
    fn test_unsupported_value_rejected_with_detail() {
        let err = build("cpushares=512").unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, FerryError::InvalidParameter { .. }));
        assert!(message.contains("cpushares"));
        assert!(message.contains("512"));

        assert!(build("networkmode=host").is_err());
        assert!(build("version=3").is_err());
        assert!(build("rm=2").is_err());
        assert!(build("ulimits=%5B%7B%22Name%22%3A%22nofile%22%7D%5D").is_err());
    }

    #[test]
    fn test_single_cache_source() {
        let params = build("cachefrom=%5B%22ghcr.io%2Fa%3Acache%22%5D").unwrap();
        assert_eq!(params.options.cache_from.as_deref(), Some("ghcr.io/a:cache"));

        let err = build("cachefrom=%5B%22a%22%2C%22b%22%5D").unwrap_err();
        assert!(err.to_string().contains("cachefrom"));
    }

    #[test]
    fn test_resource_limits() {
        let params = build("cpuquota=50000&cpuperiod=100000&memory=536870912").unwrap();
        assert_eq!(params.limits.cpu_millis, 500);
        assert_eq!(params.limits.memory_bytes, 536870912);

        let params = build("cpuquota=200000").unwrap();
        assert_eq!(params.limits.cpu_millis, 2000);

        assert!(build("memory=lots").is_err());
    }

    #[test]
    fn test_malformed_json() {
        let err = build("buildargs=%7Bnope").unwrap_err();
        assert!(matches!(err, FerryError::InvalidParameter { ref name, .. } if name == "buildargs"));
    }

    #[test]
    fn test_query_params() {
        let params = QueryParams::parse(Some("t=a&t=b&tag=&x=1"));
        assert_eq!(params.get("x"), Some("1"));
        assert_eq!(params.get("tag"), Some(""));
        assert_eq!(params.non_empty("tag"), None);
        assert_eq!(params.get_all("t").collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(QueryParams::parse(None).get("t"), None);
    }
}
