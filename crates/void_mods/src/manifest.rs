//! Mod manifest validation
//!
//! A manifest is the `mod.json` document at the top of every package. It is
//! decoded with `serde_json` and then validated field by field into a
//! [`ModDescriptor`]. Validation is all-or-nothing: either a complete
//! descriptor comes back or an error naming the offending field.
//!
//! ```json
//! {
//!     "schema": 1,
//!     "id": "example.mod",
//!     "version": "v1.0.0",
//!     "name": "Example",
//!     "developer": "Someone",
//!     "linux": "example.so",
//!     "dependencies": [
//!         { "id": "example.api", "version": "v1.2.0", "required": true }
//!     ]
//! }
//! ```

use crate::config::{SCHEMA_MAX, SCHEMA_MIN};
use crate::error::ValidationError;
use crate::resolve::ResolveState;
use serde_json::{Map, Value};
use std::path::PathBuf;
use void_core::{ModId, VersionInfo};

/// Schema assumed when a manifest has no `schema` key
pub const DEFAULT_SCHEMA: i64 = 1;

/// Host platform, selecting the manifest key that names the mod binary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    Windows,
    MacOs,
    Linux,
    Android,
}

impl Platform {
    /// Platform this crate was compiled for
    pub fn current() -> Self {
        if cfg!(target_os = "windows") {
            Platform::Windows
        } else if cfg!(target_os = "macos") {
            Platform::MacOs
        } else if cfg!(target_os = "android") {
            Platform::Android
        } else {
            Platform::Linux
        }
    }

    /// Manifest key holding the binary name
    pub fn manifest_key(self) -> &'static str {
        match self {
            Platform::Windows => "windows",
            Platform::MacOs => "macos",
            Platform::Linux => "linux",
            Platform::Android => "android",
        }
    }

    /// Binary name used when the manifest does not declare one
    pub fn default_binary(self) -> &'static str {
        match self {
            Platform::Windows => "mod.dll",
            Platform::MacOs => "mod.dylib",
            Platform::Linux | Platform::Android => "mod.so",
        }
    }
}

/// A dependency declared by a mod, plus its resolution status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRequirement {
    pub target: ModId,
    pub min_version: VersionInfo,
    /// Optional dependencies never block activation
    pub required: bool,

    pub state: ResolveState,
    /// Set while the target is an active mod
    pub loaded_ref: Option<ModId>,
    /// Set while the target is a pending mod
    pub pending_ref: Option<ModId>,
    /// The target was found but its version is below `min_version`
    pub version_mismatch: bool,
    /// The target leads back to the declaring mod through required dependencies
    pub in_cycle: bool,
}

impl DependencyRequirement {
    pub fn new(target: ModId, min_version: VersionInfo, required: bool) -> Self {
        Self {
            target,
            min_version,
            required,
            state: ResolveState::Unloaded,
            loaded_ref: None,
            pending_ref: None,
            version_mismatch: false,
            in_cycle: false,
        }
    }

    /// Whether this requirement lets its mod run
    pub fn is_satisfied(&self) -> bool {
        !self.required || self.state == ResolveState::Loaded
    }
}

/// Validated description of a mod
#[derive(Debug, Clone)]
pub struct ModDescriptor {
    pub id: ModId,
    pub name: String,
    pub developer: String,
    pub description: String,
    pub details: String,
    pub credits: String,
    pub version: VersionInfo,
    pub schema: i64,
    /// Package the manifest was read from, empty for in-process mods
    pub package_path: PathBuf,
    /// File name of the native binary inside the package
    pub binary_name: String,
    pub dependencies: Vec<DependencyRequirement>,
}

impl ModDescriptor {
    /// Descriptor for a mod that does not come from a package
    pub fn new(id: impl Into<ModId>, version: VersionInfo) -> Self {
        let id = id.into();
        Self {
            name: id.as_str().to_string(),
            id,
            developer: String::new(),
            description: String::new(),
            details: String::new(),
            credits: String::new(),
            version,
            schema: DEFAULT_SCHEMA,
            package_path: PathBuf::new(),
            binary_name: Platform::current().default_binary().to_string(),
            dependencies: Vec::new(),
        }
    }

    /// Add a dependency
    pub fn depends_on(mut self, target: impl Into<ModId>, min_version: VersionInfo, required: bool) -> Self {
        self.dependencies
            .push(DependencyRequirement::new(target.into(), min_version, required));
        self
    }

    pub fn with_package_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.package_path = path.into();
        self
    }

    pub fn dependency(&self, target: &ModId) -> Option<&DependencyRequirement> {
        self.dependencies.iter().find(|dep| &dep.target == target)
    }

    /// Every required dependency is loaded and enabled
    pub fn is_ready(&self) -> bool {
        self.dependencies.iter().all(DependencyRequirement::is_satisfied)
    }

    /// Required dependencies that are not loaded
    pub fn unmet_dependencies(&self) -> Vec<ModId> {
        self.dependencies
            .iter()
            .filter(|dep| !dep.is_satisfied())
            .map(|dep| dep.target.clone())
            .collect()
    }
}

/// Validate a manifest for the current platform
pub fn validate(document: &Value, package_path: impl Into<PathBuf>) -> Result<ModDescriptor, ValidationError> {
    validate_for(document, package_path, Platform::current())
}

/// Validate a manifest, picking the binary name for `platform`
pub fn validate_for(
    document: &Value,
    package_path: impl Into<PathBuf>,
    platform: Platform,
) -> Result<ModDescriptor, ValidationError> {
    let object = document.as_object().ok_or(ValidationError::NotAnObject)?;

    let schema = match object.get("schema") {
        None => DEFAULT_SCHEMA,
        Some(value) => value.as_i64().ok_or(ValidationError::TypeMismatch {
            field: "schema",
            expected: "an integer",
        })?,
    };
    if !(SCHEMA_MIN..=SCHEMA_MAX).contains(&schema) {
        return Err(ValidationError::SchemaOutOfRange {
            found: schema,
            min: SCHEMA_MIN,
            max: SCHEMA_MAX,
        });
    }

    // Only one schema exists so far; newer ones get their own mapper here
    validate_schema_v1(object, schema, package_path.into(), platform)
}

fn validate_schema_v1(
    object: &Map<String, Value>,
    schema: i64,
    package_path: PathBuf,
    platform: Platform,
) -> Result<ModDescriptor, ValidationError> {
    let id = ModId::parse(required_str(object, "id")?)?;
    let version = VersionInfo::parse(required_str(object, "version")?)
        .map_err(|source| ValidationError::InvalidVersion { field: "version", source })?;
    let name = required_str(object, "name")?.to_string();
    let developer = required_str(object, "developer")?.to_string();

    let description = optional_str(object, "description")?.unwrap_or_default();
    let details = optional_str(object, "details")?.unwrap_or_default();
    let credits = optional_str(object, "credits")?.unwrap_or_default();
    let binary_name = optional_str(object, platform.manifest_key())?
        .unwrap_or_else(|| platform.default_binary().to_string());
    if !is_plain_file_name(&binary_name) {
        return Err(ValidationError::InvalidBinaryName {
            field: platform.manifest_key(),
            name: binary_name,
        });
    }

    let dependencies = match object.get("dependencies") {
        None => Vec::new(),
        Some(Value::Array(entries)) => parse_dependencies(&id, entries),
        Some(_) => {
            return Err(ValidationError::TypeMismatch {
                field: "dependencies",
                expected: "an array",
            })
        }
    };

    Ok(ModDescriptor {
        id,
        name,
        developer,
        description,
        details,
        credits,
        version,
        schema,
        package_path,
        binary_name,
        dependencies,
    })
}

fn required_str<'a>(object: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, ValidationError> {
    match object.get(field) {
        None => Err(ValidationError::MissingField(field)),
        Some(Value::String(value)) => Ok(value),
        Some(_) => Err(ValidationError::TypeMismatch {
            field,
            expected: "a string",
        }),
    }
}

/// A single file name at the top of the package
fn is_plain_file_name(name: &str) -> bool {
    !name.is_empty()
        && !name.chars().all(|c| c == '.')
        && !name.chars().any(|c| matches!(c, '/' | '\\' | ':' | '\0'))
}

fn optional_str(object: &Map<String, Value>, field: &'static str) -> Result<Option<String>, ValidationError> {
    match object.get(field) {
        None => Ok(None),
        Some(Value::String(value)) => Ok(Some(value.clone())),
        Some(_) => Err(ValidationError::TypeMismatch {
            field,
            expected: "a string",
        }),
    }
}

fn parse_dependencies(owner: &ModId, entries: &[Value]) -> Vec<DependencyRequirement> {
    let mut dependencies: Vec<DependencyRequirement> = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let dependency = match parse_dependency(entry) {
            Ok(dependency) => dependency,
            Err(reason) => {
                log::warn!("Mod '{}': skipping dependency #{}: {}", owner, index, reason);
                continue;
            }
        };
        if &dependency.target == owner {
            log::warn!("Mod '{}' lists itself as a dependency, ignoring", owner);
            continue;
        }
        if dependencies.iter().any(|dep| dep.target == dependency.target) {
            log::warn!("Mod '{}' lists '{}' twice, keeping the first", owner, dependency.target);
            continue;
        }
        dependencies.push(dependency);
    }
    dependencies
}

fn parse_dependency(entry: &Value) -> Result<DependencyRequirement, String> {
    let object = entry.as_object().ok_or("not an object")?;
    let target = match object.get("id") {
        Some(Value::String(id)) => ModId::parse(id).map_err(|e| e.to_string())?,
        Some(_) => return Err("'id' is not a string".to_string()),
        None => return Err("missing 'id'".to_string()),
    };
    let min_version = match object.get("version") {
        None => VersionInfo::ZERO,
        Some(Value::String(version)) => VersionInfo::parse(version).map_err(|e| e.to_string())?,
        Some(_) => return Err("'version' is not a string".to_string()),
    };
    let required = match object.get("required") {
        None => false,
        Some(Value::Bool(required)) => *required,
        Some(_) => return Err("'required' is not a boolean".to_string()),
    };
    Ok(DependencyRequirement::new(target, min_version, required))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use void_core::version;

    fn base() -> Value {
        json!({
            "id": "example.mod",
            "version": "v1.2.3",
            "name": "Example",
            "developer": "Dev",
        })
    }

    fn without(field: &str) -> Value {
        let mut doc = base();
        doc.as_object_mut().unwrap().remove(field);
        doc
    }

    #[test]
    fn test_minimal_manifest() {
        let descriptor = validate_for(&base(), "mods/example.vmod", Platform::Linux).unwrap();
        assert_eq!(descriptor.id, ModId::new("EXAMPLE.MOD"));
        assert_eq!(descriptor.version, version!(1, 2, 3));
        assert_eq!(descriptor.schema, 1);
        assert_eq!(descriptor.binary_name, "mod.so");
        assert_eq!(descriptor.description, "");
        assert!(descriptor.dependencies.is_empty());
        assert_eq!(descriptor.package_path, PathBuf::from("mods/example.vmod"));
    }

    #[test]
    fn test_required_fields() {
        for field in ["id", "version", "name", "developer"] {
            let err = validate(&without(field), "x").unwrap_err();
            assert_eq!(err, ValidationError::MissingField(field), "field {}", field);
        }
    }

    #[test]
    fn test_type_mismatch() {
        let mut doc = base();
        doc["name"] = json!(42);
        assert_eq!(
            validate(&doc, "x").unwrap_err(),
            ValidationError::TypeMismatch { field: "name", expected: "a string" }
        );

        let mut doc = base();
        doc["credits"] = json!(["a", "b"]);
        assert!(matches!(
            validate(&doc, "x"),
            Err(ValidationError::TypeMismatch { field: "credits", .. })
        ));

        let mut doc = base();
        doc["dependencies"] = json!({"id": "other"});
        assert!(matches!(
            validate(&doc, "x"),
            Err(ValidationError::TypeMismatch { field: "dependencies", .. })
        ));
    }

    #[test]
    fn test_not_an_object() {
        assert_eq!(validate(&json!([1, 2]), "x").unwrap_err(), ValidationError::NotAnObject);
    }

    #[test]
    fn test_schema_bounds() {
        for schema in [-1i64, 0, 1, 2, 100] {
            let mut doc = base();
            doc["schema"] = json!(schema);
            let result = validate(&doc, "x");
            if (SCHEMA_MIN..=SCHEMA_MAX).contains(&schema) {
                assert_eq!(result.unwrap().schema, schema);
            } else {
                assert_eq!(
                    result.unwrap_err(),
                    ValidationError::SchemaOutOfRange { found: schema, min: SCHEMA_MIN, max: SCHEMA_MAX }
                );
            }
        }

        let mut doc = base();
        doc["schema"] = json!("1");
        assert!(matches!(
            validate(&doc, "x"),
            Err(ValidationError::TypeMismatch { field: "schema", .. })
        ));
    }

    #[test]
    fn test_invalid_version_and_id() {
        let mut doc = base();
        doc["version"] = json!("v1.2");
        assert!(matches!(
            validate(&doc, "x"),
            Err(ValidationError::InvalidVersion { field: "version", .. })
        ));

        let mut doc = base();
        doc["id"] = json!("has space");
        assert!(matches!(validate(&doc, "x"), Err(ValidationError::InvalidId(_))));
    }

    #[test]
    fn test_binary_name_must_stay_in_package() {
        for name in ["../../victim/mod.so", "/etc/mod.so", "sub\\mod.dll", "C:mod.dll", "..", ""] {
            let mut doc = base();
            doc["linux"] = json!(name);
            assert!(
                matches!(
                    validate_for(&doc, "x", Platform::Linux),
                    Err(ValidationError::InvalidBinaryName { field: "linux", .. })
                ),
                "binary name {:?}",
                name
            );
        }

        let mut doc = base();
        doc["linux"] = json!("libexample..so");
        assert_eq!(validate_for(&doc, "x", Platform::Linux).unwrap().binary_name, "libexample..so");
    }

    #[test]
    fn test_platform_binary() {
        let mut doc = base();
        doc["windows"] = json!("example.dll");
        assert_eq!(validate_for(&doc, "x", Platform::Windows).unwrap().binary_name, "example.dll");
        assert_eq!(validate_for(&doc, "x", Platform::MacOs).unwrap().binary_name, "mod.dylib");
        assert_eq!(validate_for(&doc, "x", Platform::Android).unwrap().binary_name, "mod.so");
    }

    #[test]
    fn test_dependencies() {
        let mut doc = base();
        doc["dependencies"] = json!([
            { "id": "api", "version": "v2.0.0", "required": true },
            { "id": "extras" },
            { "version": "v1.0.0" },
            { "id": "bad", "version": "two" },
            { "id": "bad2", "required": "yes" },
            "loose",
            { "id": "example.mod" },
            { "id": "API" },
        ]);
        let descriptor = validate(&doc, "x").unwrap();
        let deps = &descriptor.dependencies;
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[0].target, ModId::new("api"));
        assert_eq!(deps[0].min_version, version!(2, 0, 0));
        assert!(deps[0].required);
        assert_eq!(deps[1].target, ModId::new("extras"));
        assert_eq!(deps[1].min_version, VersionInfo::ZERO);
        assert!(!deps[1].required);
        assert!(deps.iter().all(|d| d.state == ResolveState::Unloaded));
    }

    #[test]
    fn test_descriptor_builder() {
        let descriptor = ModDescriptor::new("b", version!(1, 0, 0))
            .depends_on("a", version!(0, 1, 0), true)
            .depends_on("c", VersionInfo::ZERO, false);
        assert!(!descriptor.is_ready());
        assert_eq!(descriptor.unmet_dependencies(), vec![ModId::new("a")]);
        assert!(descriptor.dependency(&ModId::new("C")).is_some());
    }
}
