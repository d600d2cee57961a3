//! Generation profiles: one contract, two generator configurations.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::binding::DependencyScope;
use crate::fsx::sha256_hex;

/// The two pipeline branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// Interface-only server skeleton.
    Server,
    /// Client SDK.
    Client,
}

impl TargetKind {
    /// Both branches, in report order.
    pub const ALL: [TargetKind; 2] = [TargetKind::Server, TargetKind::Client];

    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Server => "server",
            TargetKind::Client => "client",
        }
    }

    /// Generator used when the configuration does not name one.
    pub fn default_generator(self) -> &'static str {
        match self {
            TargetKind::Server => "kotlin-spring",
            TargetKind::Client => "kotlin",
        }
    }

    /// Libraries the generated code needs on top of the shared set: the
    /// web framework and its annotations for the server, the HTTP transport
    /// and its serialization adapter for the client. Versions are left to
    /// the toolchain.
    pub fn default_dependencies(self) -> DependencyScope {
        let list = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        match self {
            TargetKind::Server => DependencyScope {
                implementation: list(&[
                    "org.springframework.boot:spring-boot-starter-web",
                    "jakarta.validation:jakarta.validation-api",
                ]),
                runtime_only: Vec::new(),
                compile_only: list(&[
                    "io.swagger.core.v3:swagger-annotations",
                    "jakarta.annotation:jakarta.annotation-api",
                ]),
            },
            TargetKind::Client => DependencyScope {
                implementation: list(&[
                    "io.ktor:ktor-client-core",
                    "io.ktor:ktor-client-content-negotiation",
                    "io.ktor:ktor-serialization-kotlinx-json",
                ]),
                runtime_only: list(&["io.ktor:ktor-client-cio"]),
                compile_only: Vec::new(),
            },
        }
    }

    /// Built-in generator options; user options override them key by key.
    pub fn default_options(self) -> BTreeMap<String, String> {
        let pairs: &[(&str, &str)] = match self {
            TargetKind::Server => &[
                ("interfaceOnly", "true"),
                ("skipDefaultInterface", "true"),
                ("useTags", "true"),
                ("dateLibrary", "java8"),
            ],
            TargetKind::Client => &[
                ("library", "jvm-ktor"),
                ("useCoroutines", "true"),
                ("serializationLibrary", "kotlinx_serialization"),
                ("enumPropertyNaming", "UPPERCASE"),
            ],
        };
        to_map(pairs)
    }

    /// Generator-wide switches (as opposed to generator-specific options).
    pub fn global_properties(self) -> BTreeMap<String, String> {
        match self {
            TargetKind::Server => BTreeMap::new(),
            TargetKind::Client => to_map(&[("apiTests", "false"), ("modelTests", "false")]),
        }
    }
}

fn to_map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

impl fmt::Display for TargetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "server" => Ok(TargetKind::Server),
            "client" => Ok(TargetKind::Client),
            other => Err(format!("unknown target '{}' (expected server or client)", other)),
        }
    }
}

/// Namespaces the generator writes into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageNames {
    pub root: String,
    pub api: String,
    pub model: String,
    pub invoker: String,
}

impl PackageNames {
    /// Derive api/model/invoker packages below a root package.
    pub fn under(root: &str) -> Self {
        Self {
            root: root.to_string(),
            api: format!("{}.api", root),
            model: format!("{}.model", root),
            invoker: format!("{}.infrastructure", root),
        }
    }

    pub fn all(&self) -> [&str; 4] {
        [&self.root, &self.api, &self.model, &self.invoker]
    }

    /// First pair of packages where one equals or nests inside the other.
    pub fn overlap_with<'a>(&'a self, other: &'a PackageNames) -> Option<(&'a str, &'a str)> {
        for mine in self.all() {
            for theirs in other.all() {
                if package_nests(mine, theirs) || package_nests(theirs, mine) {
                    return Some((mine, theirs));
                }
            }
        }
        None
    }
}

/// `inner` equals `outer` or lives below it (`a.b` nests in `a`, `ab` does not).
fn package_nests(inner: &str, outer: &str) -> bool {
    inner == outer
        || inner
            .strip_prefix(outer)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Settings for one generation target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileSettings {
    /// Generator identity passed to the engine (e.g. `kotlin-spring`).
    pub generator: String,
    pub packages: PackageNames,
    /// User options; merged over the built-in defaults.
    pub options: BTreeMap<String, String>,
}

/// One generator configuration per branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationProfile {
    Server(ProfileSettings),
    Client(ProfileSettings),
}

impl GenerationProfile {
    pub fn new(kind: TargetKind, settings: ProfileSettings) -> Self {
        match kind {
            TargetKind::Server => GenerationProfile::Server(settings),
            TargetKind::Client => GenerationProfile::Client(settings),
        }
    }

    pub fn kind(&self) -> TargetKind {
        match self {
            GenerationProfile::Server(_) => TargetKind::Server,
            GenerationProfile::Client(_) => TargetKind::Client,
        }
    }

    pub fn settings(&self) -> &ProfileSettings {
        match self {
            GenerationProfile::Server(s) | GenerationProfile::Client(s) => s,
        }
    }

    pub fn generator(&self) -> &str {
        &self.settings().generator
    }

    pub fn packages(&self) -> &PackageNames {
        &self.settings().packages
    }

    /// Built-in defaults for this variant overlaid with the user's options.
    pub fn effective_options(&self) -> BTreeMap<String, String> {
        let mut options = self.kind().default_options();
        options.extend(
            self.settings()
                .options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        options
    }

    pub fn global_properties(&self) -> BTreeMap<String, String> {
        self.kind().global_properties()
    }

    /// Digest of everything that shapes this profile's output.
    ///
    /// Covers only this profile, so editing the client options never
    /// invalidates the server sources.
    pub fn fingerprint(&self) -> String {
        let packages = self.packages();
        let mut canonical = format!(
            "kind={}\ngenerator={}\nroot={}\napi={}\nmodel={}\ninvoker={}\n",
            self.kind(),
            self.generator(),
            packages.root,
            packages.api,
            packages.model,
            packages.invoker
        );
        for (key, value) in self.effective_options() {
            canonical.push_str(&format!("option:{}={}\n", key, value));
        }
        for (key, value) in self.global_properties() {
            canonical.push_str(&format!("global:{}={}\n", key, value));
        }
        sha256_hex(canonical.as_bytes())
    }
}
