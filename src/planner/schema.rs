//! Per-type resource schemas.
//!
//! The diff engine asks the registry which fields of a type are
//! identity-defining (a change forces replacement), which are sensitive
//! (masked in plans), and which replacement order a type needs.

use std::collections::HashMap;

use super::plan::ReplacePolicy;
use crate::resource::ResourceSpec;

/// Fields masked for every type.
const COMMON_SENSITIVE: &[&str] = &["password", "secretString", "result", "token"];

/// Schema of a single resource type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeSchema {
    /// Resource type.
    pub resource_type: &'static str,
    /// Fields whose change forces replacement.
    pub replace_fields: &'static [&'static str],
    /// Extra sensitive fields.
    pub sensitive_fields: &'static [&'static str],
    /// Replacement order the type requires, if any.
    pub default_policy: Option<ReplacePolicy>,
}

/// Types emitted by the MySQL component.
pub const BUILTIN_SCHEMAS: &[TypeSchema] = &[
    TypeSchema {
        resource_type: "random:RandomPassword",
        replace_fields: &["length", "special", "overrideSpecial"],
        sensitive_fields: &[],
        default_policy: None,
    },
    TypeSchema {
        resource_type: "aws:secretsmanager:Secret",
        replace_fields: &["name", "namePrefix"],
        sensitive_fields: &[],
        default_policy: None,
    },
    TypeSchema {
        resource_type: "aws:secretsmanager:SecretVersion",
        replace_fields: &["secretId", "secretString"],
        sensitive_fields: &[],
        default_policy: None,
    },
    TypeSchema {
        resource_type: "aws:rds:SubnetGroup",
        replace_fields: &["name"],
        sensitive_fields: &[],
        default_policy: None,
    },
    TypeSchema {
        resource_type: "aws:rds:ParameterGroup",
        replace_fields: &["name", "family"],
        sensitive_fields: &[],
        default_policy: None,
    },
    TypeSchema {
        resource_type: "aws:rds:Instance",
        replace_fields: &[
            "engine",
            "dbName",
            "username",
            "storageEncrypted",
            "availabilityZone",
            "replicateSourceDb",
        ],
        sensitive_fields: &[],
        default_policy: Some(ReplacePolicy::DeleteBeforeCreate),
    },
    TypeSchema {
        resource_type: "aws:iam:Role",
        replace_fields: &["name"],
        sensitive_fields: &[],
        default_policy: None,
    },
    TypeSchema {
        resource_type: "aws:iam:RoleLookup",
        replace_fields: &["name"],
        sensitive_fields: &[],
        default_policy: None,
    },
    TypeSchema {
        resource_type: "aws:rds:Proxy",
        replace_fields: &["name", "engineFamily"],
        sensitive_fields: &[],
        default_policy: None,
    },
    TypeSchema {
        resource_type: "aws:rds:ProxyDefaultTargetGroup",
        replace_fields: &["dbProxyName"],
        sensitive_fields: &[],
        default_policy: None,
    },
    TypeSchema {
        resource_type: "aws:rds:ProxyTarget",
        replace_fields: &["dbProxyName", "targetGroupName", "dbInstanceIdentifier"],
        sensitive_fields: &[],
        default_policy: None,
    },
];

/// Registry of known type schemas plus the program-wide default policy.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<&'static str, TypeSchema>,
    default_policy: ReplacePolicy,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SchemaRegistry {
    /// Creates a registry with no schemas.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            schemas: HashMap::new(),
            default_policy: ReplacePolicy::default(),
        }
    }

    /// Creates a registry holding the built-in schemas.
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for schema in BUILTIN_SCHEMAS {
            registry.register(*schema);
        }
        registry
    }

    /// Sets the program-wide default replacement policy.
    #[must_use]
    pub const fn with_default_policy(mut self, policy: ReplacePolicy) -> Self {
        self.default_policy = policy;
        self
    }

    /// Registers or replaces a schema.
    pub fn register(&mut self, schema: TypeSchema) {
        self.schemas.insert(schema.resource_type, schema);
    }

    /// Gets the schema for a type.
    #[must_use]
    pub fn get(&self, resource_type: &str) -> Option<&TypeSchema> {
        self.schemas.get(resource_type)
    }

    /// Returns true if changing `field` replaces the resource.
    #[must_use]
    pub fn forces_replacement(&self, spec: &ResourceSpec, field: &str) -> bool {
        spec.replace_on.iter().any(|f| f == field)
            || self
                .get(&spec.resource_type)
                .is_some_and(|s| s.replace_fields.contains(&field))
    }

    /// Returns true if values of `field` must be masked.
    #[must_use]
    pub fn is_sensitive(&self, resource_type: &str, field: &str) -> bool {
        COMMON_SENSITIVE.contains(&field)
            || self
                .get(resource_type)
                .is_some_and(|s| s.sensitive_fields.contains(&field))
    }

    /// Replacement policy: spec override, then type default, then program default.
    #[must_use]
    pub fn policy_for(&self, spec: &ResourceSpec) -> ReplacePolicy {
        spec.replace_policy
            .or_else(|| self.get(&spec.resource_type).and_then(|s| s.default_policy))
            .unwrap_or(self.default_policy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_policy_precedence() {
        let registry = SchemaRegistry::builtin();

        let instance = ResourceSpec::new("Db", "aws:rds:Instance", json!({}));
        assert_eq!(registry.policy_for(&instance), ReplacePolicy::DeleteBeforeCreate);

        let overridden = instance.with_replace_policy(ReplacePolicy::CreateBeforeDelete);
        assert_eq!(registry.policy_for(&overridden), ReplacePolicy::CreateBeforeDelete);

        let other = ResourceSpec::new("G", "aws:rds:SubnetGroup", json!({}));
        assert_eq!(registry.policy_for(&other), ReplacePolicy::CreateBeforeDelete);

        let registry = registry.with_default_policy(ReplacePolicy::DeleteBeforeCreate);
        assert_eq!(registry.policy_for(&other), ReplacePolicy::DeleteBeforeCreate);
    }

    #[test]
    fn test_identity_fields() {
        let registry = SchemaRegistry::builtin();
        let spec = ResourceSpec::new("Db", "aws:rds:Instance", json!({})).with_replace_on(&["tags"]);

        assert!(registry.forces_replacement(&spec, "engine"));
        assert!(registry.forces_replacement(&spec, "tags"));
        assert!(!registry.forces_replacement(&spec, "instanceClass"));

        let unknown = ResourceSpec::new("X", "custom:Thing", json!({}));
        assert!(!registry.forces_replacement(&unknown, "anything"));
    }

    #[test]
    fn test_sensitive_fields() {
        let registry = SchemaRegistry::builtin();
        assert!(registry.is_sensitive("aws:rds:Instance", "password"));
        assert!(registry.is_sensitive("custom:Thing", "secretString"));
        assert!(!registry.is_sensitive("aws:rds:Instance", "port"));
    }
}
