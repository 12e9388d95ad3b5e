//! MySQL database component.
//!
//! Raw [`DatabaseConfig`] options are resolved once into a [`Mysql`] holding
//! a [`MysqlMode`]. In `New` mode the component expands into resource
//! declarations wired together by `${Name.output}` references; `Reference`
//! and `LocalDev` declare nothing. Connection attributes are resolved once
//! into an immutable [`MysqlOutputs`].

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::config::{DatabaseConfig, ProgramSection, ProxyCredential, TransformConfig};
use crate::error::{ConfigError, ReconcileError, Result};
use crate::provider::{Provider, SecretStore};
use crate::resource::{ResourceSpec, as_text, escape_literals, json_string, literal, reference};
use crate::state::StateSnapshot;

/// Default engine version.
pub const DEFAULT_VERSION: &str = "8.0.40";
/// Default master username.
pub const DEFAULT_USERNAME: &str = "root";
/// Default instance type.
pub const DEFAULT_INSTANCE: &str = "t4g.micro";
/// Default maximum storage.
pub const DEFAULT_STORAGE: &str = "20 GB";
/// Smallest allowed storage, in GB.
pub const MIN_STORAGE_GB: u64 = 20;
/// Largest allowed storage, in GB.
pub const MAX_STORAGE_GB: u64 = 65536;
/// Largest number of read replicas.
pub const MAX_REPLICAS: u32 = 15;
/// Id reported in local dev mode.
pub const PLACEHOLDER_ID: &str = "placeholder";
/// Instance tag naming the password secret.
pub const PASSWORD_TAG: &str = "sst:ref:password";
/// Instance tag carrying the component version.
pub const VERSION_TAG: &str = "sst:component-version";

const COMPONENT_VERSION: u32 = 1;
const GENERATED_PASSWORD_LENGTH: u32 = 32;
const RDS_SERVICE_ROLE: &str = "AWSServiceRoleForRDS";

/// A resolved MySQL database.
#[derive(Debug, Clone, PartialEq)]
pub struct Mysql {
    name: String,
    mode: MysqlMode,
}

/// How a database is provided.
#[derive(Debug, Clone, PartialEq)]
pub enum MysqlMode {
    /// Provisioned by this program.
    New(NewDatabase),
    /// Existing database, read through the provider.
    Reference {
        /// Instance identifier.
        id: String,
        /// Proxy identifier.
        proxy_id: Option<String>,
    },
    /// Locally running database used in dev mode.
    LocalDev(LocalDatabase),
}

/// Options of a provisioned database.
#[derive(Debug, Clone, PartialEq)]
pub struct NewDatabase {
    /// Engine version.
    pub version: String,
    /// Master username.
    pub username: String,
    /// Master password; `None` generates one.
    pub password: Option<String>,
    /// Database name.
    pub database: String,
    /// Instance type without the `db.` prefix.
    pub instance: String,
    /// Maximum storage in GB.
    pub storage_gb: u64,
    /// Multi-AZ deployment.
    pub multi_az: bool,
    /// Number of read replicas.
    pub replicas: u32,
    /// Extra proxy users; `None` means no proxy.
    pub proxy: Option<Vec<ProxyCredential>>,
    /// Private subnet ids.
    pub subnets: Vec<String>,
    /// Input overrides.
    pub transform: TransformConfig,
}

/// Connection settings of a local database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDatabase {
    /// Host.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
    /// Database name.
    pub database: String,
}

/// Connection attributes of a database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MysqlOutputs {
    /// Component name.
    pub name: String,
    /// Instance identifier.
    pub id: String,
    /// Proxy identifier.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy_id: Option<String>,
    /// Host to connect to: the proxy endpoint when there is one.
    pub host: String,
    /// Port.
    pub port: u16,
    /// Username.
    pub username: String,
    /// Password.
    pub password: String,
    /// Database name.
    pub database: String,
}

/// Parses a storage size like `"20 GB"` or `"2 TB"` into GB.
///
/// # Errors
///
/// Returns a message if the size has no valid number or unit.
pub fn parse_storage(size: &str) -> std::result::Result<u64, String> {
    let trimmed = size.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("Storage '{size}' has no unit; use GB or TB"))?;
    let (number, unit) = trimmed.split_at(split);
    let number: u64 = number
        .parse()
        .map_err(|_| format!("Storage '{size}' does not start with a number"))?;

    match unit.trim() {
        "GB" => Ok(number),
        "TB" => number
            .checked_mul(1024)
            .ok_or_else(|| format!("Storage '{size}' is too large")),
        other => Err(format!("Storage unit '{other}' is not supported; use GB or TB")),
    }
}

/// Whether `name` can be used as a MySQL database name.
#[must_use]
pub fn is_valid_database_name(name: &str) -> bool {
    let mut chars = name.chars();
    chars.next().is_some_and(|c| c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Default database name for a program.
#[must_use]
pub fn default_database_name(program: &str) -> String {
    program.replace('-', "_")
}

/// `mysql<major>.<minor>` for an engine version.
fn parameter_family(version: &str) -> std::result::Result<String, String> {
    let mut parts = version.split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor))
            if !major.is_empty()
                && !minor.is_empty()
                && major.chars().all(|c| c.is_ascii_digit())
                && minor.chars().all(|c| c.is_ascii_digit()) =>
        {
            Ok(format!("mysql{major}.{minor}"))
        }
        _ => Err(format!("Version '{version}' is not of the form <major>.<minor>[.<patch>]")),
    }
}

/// Performance insights are unavailable on micro and small instances.
fn supports_performance_insights(instance: &str) -> bool {
    !instance.ends_with(".micro") && !instance.ends_with(".small")
}

/// Shallow-merges `overrides` over `base`. Override values are user text and
/// never carry references.
fn merge(mut base: Value, overrides: Option<&Map<String, Value>>) -> Value {
    if let (Value::Object(map), Some(overrides)) = (&mut base, overrides) {
        for (key, value) in overrides {
            map.insert(key.clone(), escape_literals(value.clone()));
        }
    }
    base
}

/// Primary instance inputs a read replica inherits.
const REPLICA_FIELDS: &[&str] = &[
    "dbSubnetGroupName",
    "availabilityZone",
    "engine",
    "engineVersion",
    "instanceClass",
    "username",
    "password",
    "parameterGroupName",
    "storageEncrypted",
    "storageType",
    "allocatedStorage",
    "maxAllocatedStorage",
];

/// Inputs of read replica `index`, taken from the primary's final inputs
/// (transform overrides included).
fn replica_inputs(primary: &str, instance_inputs: &Value, index: u32) -> Value {
    let mut inputs = Map::new();
    inputs.insert(String::from("replicateSourceDb"), json!(reference(primary, "identifier")));
    if let Some(db_name) = instance_inputs.get("dbName").and_then(as_text) {
        inputs.insert(
            String::from("dbName"),
            escape_literals(json!(format!("{db_name}_replica{index}"))),
        );
    }
    for field in REPLICA_FIELDS {
        if let Some(value) = instance_inputs.get(*field) {
            inputs.insert((*field).to_string(), value.clone());
        }
    }
    inputs.insert(String::from("skipFinalSnapshot"), json!(true));
    Value::Object(inputs)
}

/// Resource name suffix for a proxy user. Characters MySQL accepts in user
/// names but logical names do not (`.`, `@` and the like) become `_`.
fn credential_suffix(username: &str) -> String {
    username
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect()
}

impl Mysql {
    /// Resolves raw options for a program.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the offending field.
    pub fn resolve(config: &DatabaseConfig, program: &ProgramSection) -> std::result::Result<Self, ConfigError> {
        let name = config.name.clone();
        let field = |f: &str| format!("databases.{name}.{f}");

        if let Some(reference) = &config.reference {
            if reference.id.is_empty() {
                return Err(ConfigError::validation("Referenced database id cannot be empty", field("reference.id")));
            }
            debug!("{name}: referencing existing database {}", reference.id);
            return Ok(Self {
                name,
                mode: MysqlMode::Reference {
                    id: reference.id.clone(),
                    proxy_id: reference.proxy_id.clone(),
                },
            });
        }

        let username = config.username.clone().unwrap_or_else(|| DEFAULT_USERNAME.to_string());
        let database = config
            .database
            .clone()
            .unwrap_or_else(|| default_database_name(&program.name));
        if !is_valid_database_name(&database) {
            return Err(ConfigError::validation(
                format!(
                    "Database name '{database}' must start with a lowercase letter and contain only lowercase letters, digits and underscores"
                ),
                field("database"),
            ));
        }

        if let (Some(dev), true) = (&config.dev, program.dev) {
            let password = dev.password.clone().or_else(|| config.password.clone()).ok_or_else(|| {
                ConfigError::validation(
                    "You must provide the password to connect to your locally running MySQL database either by setting the \"dev.password\" or by setting the top-level \"password\" property.",
                    field("dev.password"),
                )
            })?;
            debug!("{name}: using local database");
            return Ok(Self {
                name,
                mode: MysqlMode::LocalDev(LocalDatabase {
                    host: dev.host.clone().unwrap_or_else(|| String::from("localhost")),
                    port: dev.port.unwrap_or(3306),
                    username: dev.username.clone().unwrap_or(username),
                    password,
                    database: dev.database.clone().unwrap_or(database),
                }),
            });
        }

        let storage = config.storage.as_deref().unwrap_or(DEFAULT_STORAGE);
        let storage_gb = parse_storage(storage).map_err(|e| ConfigError::validation(e, field("storage")))?;
        if storage_gb < MIN_STORAGE_GB {
            return Err(ConfigError::validation(
                format!("Storage must be at least {MIN_STORAGE_GB} GB for the {name} MySQL database."),
                field("storage"),
            ));
        }
        if storage_gb > MAX_STORAGE_GB {
            return Err(ConfigError::validation(
                format!("Storage cannot be greater than {MAX_STORAGE_GB} GB (64 TB) for the {name} MySQL database."),
                field("storage"),
            ));
        }

        let version = config.version.clone().unwrap_or_else(|| DEFAULT_VERSION.to_string());
        parameter_family(&version).map_err(|e| ConfigError::validation(e, field("version")))?;

        let replicas = config.replicas.unwrap_or(0);
        if replicas > MAX_REPLICAS {
            return Err(ConfigError::validation(
                format!("A MySQL database supports at most {MAX_REPLICAS} read replicas, got {replicas}"),
                field("replicas"),
            ));
        }

        let subnets = config.vpc.as_ref().map(|v| v.subnets.clone()).unwrap_or_default();
        if subnets.is_empty() {
            return Err(ConfigError::validation(
                format!("The {name} MySQL database needs at least one subnet in \"vpc.subnets\""),
                field("vpc.subnets"),
            ));
        }

        let proxy = config
            .proxy
            .as_ref()
            .filter(|p| p.is_enabled())
            .map(|p| p.credentials().to_vec());
        if let Some(credentials) = &proxy {
            let mut suffixes: Vec<(String, &str)> = Vec::new();
            for credential in credentials {
                if credential.username.is_empty() || credential.password.is_empty() {
                    return Err(ConfigError::validation(
                        "Proxy credentials need both a username and a password",
                        field("proxy.credentials"),
                    ));
                }
                let suffix = credential_suffix(&credential.username);
                if let Some((_, other)) = suffixes.iter().find(|(s, _)| *s == suffix) {
                    return Err(ConfigError::validation(
                        format!(
                            "Proxy usernames '{other}' and '{}' both map to the resource suffix '{suffix}'",
                            credential.username
                        ),
                        field("proxy.credentials"),
                    ));
                }
                suffixes.push((suffix, credential.username.as_str()));
            }
        }

        Ok(Self {
            name,
            mode: MysqlMode::New(NewDatabase {
                version,
                username,
                password: config.password.clone(),
                database,
                instance: config.instance.clone().unwrap_or_else(|| DEFAULT_INSTANCE.to_string()),
                storage_gb,
                multi_az: config.multi_az.unwrap_or(false),
                replicas,
                proxy,
                subnets,
                transform: config.transform.clone(),
            }),
        })
    }

    /// Component name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolved mode.
    #[must_use]
    pub const fn mode(&self) -> &MysqlMode {
        &self.mode
    }

    /// Logical name of a resource this component emits.
    #[must_use]
    pub fn resource_name(&self, suffix: &str) -> String {
        format!("{}{suffix}", self.name)
    }

    /// Resource declarations, empty unless the database is provisioned here.
    #[must_use]
    pub fn resource_specs(&self) -> Vec<ResourceSpec> {
        match &self.mode {
            MysqlMode::New(db) => self.new_specs(db),
            MysqlMode::Reference { .. } | MysqlMode::LocalDev(_) => Vec::new(),
        }
    }

    fn new_specs(&self, db: &NewDatabase) -> Vec<ResourceSpec> {
        let n = |suffix: &str| self.resource_name(suffix);
        let mut specs = Vec::new();

        let username = escape_literals(json!(db.username));
        let subnets = escape_literals(json!(db.subnets));
        let password = match &db.password {
            Some(password) => literal(password.as_str()),
            None => {
                specs.push(ResourceSpec::new(
                    n("Password"),
                    "random:RandomPassword",
                    json!({"length": GENERATED_PASSWORD_LENGTH, "special": false}),
                ));
                json!(reference(&n("Password"), "result"))
            }
        };

        let secret = n("ProxySecret");
        specs.push(ResourceSpec::new(
            &secret,
            "aws:secretsmanager:Secret",
            json!({"recoveryWindowInDays": 0}),
        ));
        specs.push(ResourceSpec::new(
            n("ProxySecretVersion"),
            "aws:secretsmanager:SecretVersion",
            json!({
                "secretId": reference(&secret, "id"),
                "secretString": json_string(json!({"username": username, "password": password})),
            }),
        ));

        let subnet_group = n("SubnetGroup");
        specs.push(ResourceSpec::new(
            &subnet_group,
            "aws:rds:SubnetGroup",
            merge(json!({"subnetIds": subnets}), db.transform.subnet_group.as_ref()),
        ));

        let parameter_group = n("ParameterGroup");
        let family = parameter_family(&db.version).unwrap_or_else(|_| String::from("mysql8.0"));
        specs.push(ResourceSpec::new(
            &parameter_group,
            "aws:rds:ParameterGroup",
            merge(
                json!({
                    "family": family,
                    "parameters": [{"name": "require_secure_transport", "value": "OFF"}],
                }),
                db.transform.parameter_group.as_ref(),
            ),
        ));

        let instance = n("Instance");
        let instance_inputs = merge(
            json!({
                "dbName": db.database,
                "dbSubnetGroupName": reference(&subnet_group, "name"),
                "engine": "mysql",
                "engineVersion": escape_literals(json!(db.version)),
                "instanceClass": escape_literals(json!(format!("db.{}", db.instance))),
                "username": username,
                "password": password,
                "parameterGroupName": reference(&parameter_group, "name"),
                "skipFinalSnapshot": true,
                "storageEncrypted": true,
                "storageType": "gp3",
                "allocatedStorage": MIN_STORAGE_GB,
                "maxAllocatedStorage": db.storage_gb,
                "multiAz": db.multi_az,
                "backupRetentionPeriod": 7,
                "performanceInsightsEnabled": supports_performance_insights(&db.instance),
                "tags": {
                    VERSION_TAG: COMPONENT_VERSION.to_string(),
                    PASSWORD_TAG: reference(&secret, "id"),
                },
            }),
            db.transform.instance.as_ref(),
        );
        let replicas: Vec<ResourceSpec> = (0..db.replicas)
            .map(|i| {
                ResourceSpec::new(
                    n(&format!("Replica{i}")),
                    "aws:rds:Instance",
                    replica_inputs(&instance, &instance_inputs, i),
                )
            })
            .collect();
        specs.push(ResourceSpec::new(&instance, "aws:rds:Instance", instance_inputs));
        specs.extend(replicas);

        if let Some(credentials) = &db.proxy {
            specs.extend(self.proxy_specs(db, credentials, &secret, &instance));
        }
        specs
    }

    fn proxy_specs(
        &self,
        db: &NewDatabase,
        credentials: &[ProxyCredential],
        secret: &str,
        instance: &str,
    ) -> Vec<ResourceSpec> {
        let n = |suffix: &str| self.resource_name(suffix);
        let mut specs = Vec::new();
        let mut secrets = vec![secret.to_string()];

        for credential in credentials {
            let suffix = credential_suffix(&credential.username);
            let user_secret = n(&format!("ProxySecret{suffix}"));
            specs.push(ResourceSpec::new(
                &user_secret,
                "aws:secretsmanager:Secret",
                json!({"recoveryWindowInDays": 0}),
            ));
            specs.push(ResourceSpec::new(
                n(&format!("ProxySecretVersion{suffix}")),
                "aws:secretsmanager:SecretVersion",
                json!({
                    "secretId": reference(&user_secret, "id"),
                    "secretString": json_string(json!({
                        "username": escape_literals(json!(credential.username)),
                        "password": literal(credential.password.as_str()),
                    })),
                }),
            ));
            secrets.push(user_secret);
        }

        let secret_arns: Vec<String> = secrets.iter().map(|s| reference(s, "arn")).collect();

        let role = n("ProxyRole");
        specs.push(ResourceSpec::new(
            &role,
            "aws:iam:Role",
            json!({
                "assumeRolePolicy": json_string(json!({
                    "Version": "2012-10-17",
                    "Statement": [{
                        "Effect": "Allow",
                        "Principal": {"Service": "rds.amazonaws.com"},
                        "Action": "sts:AssumeRole",
                    }],
                })),
                "inlinePolicies": [{
                    "name": "inline",
                    "policy": json_string(json!({
                        "Version": "2012-10-17",
                        "Statement": [{
                            "Effect": "Allow",
                            "Action": ["secretsmanager:GetSecretValue"],
                            "Resource": secret_arns,
                        }],
                    })),
                }],
            }),
        ));

        let lookup = n("ProxyRoleLookup");
        specs.push(ResourceSpec::new(&lookup, "aws:iam:RoleLookup", json!({"name": RDS_SERVICE_ROLE})));

        let auths: Vec<Value> = secret_arns
            .iter()
            .map(|arn| json!({"authScheme": "SECRETS", "iamAuth": "DISABLED", "secretArn": arn}))
            .collect();
        let proxy = n("Proxy");
        specs.push(
            ResourceSpec::new(
                &proxy,
                "aws:rds:Proxy",
                merge(
                    json!({
                        "engineFamily": "MYSQL",
                        "auths": auths,
                        "roleArn": reference(&role, "arn"),
                        "vpcSubnetIds": escape_literals(json!(db.subnets)),
                    }),
                    db.transform.proxy.as_ref(),
                ),
            )
            .depends_on(&lookup),
        );

        let target_group = n("ProxyTargetGroup");
        specs.push(ResourceSpec::new(
            &target_group,
            "aws:rds:ProxyDefaultTargetGroup",
            json!({"dbProxyName": reference(&proxy, "name")}),
        ));
        specs.push(ResourceSpec::new(
            n("ProxyTarget"),
            "aws:rds:ProxyTarget",
            json!({
                "dbProxyName": reference(&proxy, "name"),
                "targetGroupName": reference(&target_group, "name"),
                "dbInstanceIdentifier": reference(instance, "identifier"),
            }),
        ));
        specs
    }

    /// Resolves connection attributes.
    ///
    /// `New` reads the applied state, `Reference` reads the instance, proxy
    /// and password secret through the provider, `LocalDev` needs neither.
    ///
    /// # Errors
    ///
    /// Returns an error if a required output is missing or a provider call
    /// fails.
    pub async fn outputs(
        &self,
        snapshot: &StateSnapshot,
        provider: &dyn Provider,
        secrets: &dyn SecretStore,
    ) -> Result<MysqlOutputs> {
        match &self.mode {
            MysqlMode::New(db) => self.new_outputs(db, snapshot),
            MysqlMode::Reference { id, proxy_id } => {
                self.reference_outputs(id, proxy_id.as_deref(), provider, secrets).await
            }
            MysqlMode::LocalDev(local) => Ok(MysqlOutputs {
                name: self.name.clone(),
                id: PLACEHOLDER_ID.to_string(),
                proxy_id: Some(PLACEHOLDER_ID.to_string()),
                host: local.host.clone(),
                port: local.port,
                username: local.username.clone(),
                password: local.password.clone(),
                database: local.database.clone(),
            }),
        }
    }

    fn missing(&self, resource: &str, output: &str) -> ReconcileError {
        ReconcileError::MissingOutput {
            resource: if resource.is_empty() { self.name.clone() } else { resource.to_string() },
            output: output.to_string(),
        }
    }

    fn new_outputs(&self, db: &NewDatabase, snapshot: &StateSnapshot) -> Result<MysqlOutputs> {
        let instance_name = self.resource_name("Instance");
        let instance = snapshot
            .resource(&instance_name)
            .ok_or_else(|| self.missing(&instance_name, "id"))?;

        let text = |key: &str| -> Result<String> {
            instance
                .output(key)
                .or_else(|| instance.resolved_inputs.get(key).cloned())
                .and_then(|v| v.as_str().map(str::to_string))
                .ok_or_else(|| self.missing(&instance_name, key).into())
        };

        let password = match &db.password {
            Some(password) => password.clone(),
            None => {
                let password_name = self.resource_name("Password");
                snapshot
                    .resource(&password_name)
                    .and_then(|s| s.output("result"))
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| self.missing(&password_name, "result"))?
            }
        };

        let port = instance
            .output("port")
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| self.missing(&instance_name, "port"))?;

        let endpoint = text("endpoint")?;
        let proxy = snapshot.resource(&self.resource_name("Proxy"));
        let host = match proxy.and_then(|p| p.output("endpoint")).and_then(|v| v.as_str().map(str::to_string)) {
            Some(proxy_endpoint) => proxy_endpoint,
            None => endpoint.split(':').next().unwrap_or(&endpoint).to_string(),
        };

        Ok(MysqlOutputs {
            name: self.name.clone(),
            id: text("identifier")?,
            proxy_id: proxy.map(|p| p.external_id.clone()),
            host,
            port,
            username: text("username")?,
            password,
            database: text("dbName")?,
        })
    }

    async fn reference_outputs(
        &self,
        id: &str,
        proxy_id: Option<&str>,
        provider: &dyn Provider,
        secrets: &dyn SecretStore,
    ) -> Result<MysqlOutputs> {
        debug!("Reading referenced database {id}");
        let instance = provider
            .read("aws:rds:Instance", id)
            .await?
            .ok_or_else(|| crate::error::ProviderError::NotFound { id: id.to_string() })?;

        let text = |key: &str| -> Result<String> {
            instance
                .get(key)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or_else(|| self.missing("", key).into())
        };

        let password_secret = instance
            .get("tags")
            .and_then(|t| t.get(PASSWORD_TAG))
            .and_then(Value::as_str)
            .ok_or_else(|| ReconcileError::PasswordUnavailable { name: self.name.clone() })?;
        let payload = secrets
            .get(password_secret)
            .await?
            .ok_or_else(|| ReconcileError::PasswordUnavailable { name: self.name.clone() })?;
        let password = serde_json::from_str::<Value>(&payload)
            .ok()
            .and_then(|v| v.get("password").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| ReconcileError::PasswordUnavailable { name: self.name.clone() })?;

        let endpoint = text("endpoint")?;
        let host = match proxy_id {
            Some(proxy_id) => {
                let proxy = provider
                    .read("aws:rds:Proxy", proxy_id)
                    .await?
                    .ok_or_else(|| crate::error::ProviderError::NotFound { id: proxy_id.to_string() })?;
                proxy
                    .get("endpoint")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| self.missing("", "proxy endpoint"))?
            }
            None => endpoint.split(':').next().unwrap_or(&endpoint).to_string(),
        };

        let port = instance
            .get("port")
            .and_then(Value::as_u64)
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| self.missing("", "port"))?;

        Ok(MysqlOutputs {
            name: self.name.clone(),
            id: id.to_string(),
            proxy_id: proxy_id.map(str::to_string),
            host,
            port,
            username: text("username")?,
            password,
            database: text("dbName")?,
        })
    }
}

impl MysqlOutputs {
    /// Proxy id.
    ///
    /// # Errors
    ///
    /// Returns `ProxyNotEnabled` if the database has no proxy.
    pub fn proxy_id(&self) -> std::result::Result<&str, ReconcileError> {
        self.proxy_id
            .as_deref()
            .ok_or_else(|| ReconcileError::ProxyNotEnabled { name: self.name.clone() })
    }

    /// Properties exposed to linked components.
    #[must_use]
    pub fn link_properties(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(String::from("database"), json!(self.database));
        map.insert(String::from("username"), json!(self.username));
        map.insert(String::from("password"), json!(self.password));
        map.insert(String::from("port"), json!(self.port));
        map.insert(String::from("host"), json!(self.host));
        map
    }
}

impl LocalDatabase {
    /// Reminder printed when a program runs against a local database.
    #[must_use]
    pub fn dev_message(&self) -> String {
        format!(
            "Make sure your local MySQL server is using:\n\n  username: \"{}\"\n  password: \"{}\"\n  database: \"{}\"\n\nListening on \"{}:{}\"...",
            self.username, self.password, self.database, self.host, self.port
        )
    }
}

impl std::fmt::Display for MysqlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::New(_) => write!(f, "new"),
            Self::Reference { .. } => write!(f, "reference"),
            Self::LocalDev(_) => write!(f, "local-dev"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DevConfig, ProxyConfig, ReferenceConfig, VpcConfig};
    use crate::provider::{MockSecretStore, SimulatedProvider};
    use crate::state::ResourceState;

    fn program(dev: bool) -> ProgramSection {
        ProgramSection {
            name: String::from("my-app"),
            stage: String::from("dev"),
            dev,
        }
    }

    fn db() -> DatabaseConfig {
        DatabaseConfig {
            name: String::from("Database"),
            vpc: Some(VpcConfig {
                subnets: vec![String::from("subnet-a"), String::from("subnet-b")],
            }),
            ..DatabaseConfig::default()
        }
    }

    fn names(mysql: &Mysql) -> Vec<String> {
        mysql.resource_specs().into_iter().map(|s| s.name).collect()
    }

    #[test]
    fn test_parse_storage() {
        assert_eq!(parse_storage("20 GB"), Ok(20));
        assert_eq!(parse_storage("100GB"), Ok(100));
        assert_eq!(parse_storage("2 TB"), Ok(2048));
        assert!(parse_storage("20").is_err());
        assert!(parse_storage("20 MB").is_err());
        assert!(parse_storage("GB").is_err());
    }

    #[test]
    fn test_defaults() {
        let mysql = Mysql::resolve(&db(), &program(false)).expect("resolve");
        let MysqlMode::New(new) = mysql.mode() else {
            panic!("expected new mode");
        };
        assert_eq!(new.version, "8.0.40");
        assert_eq!(new.username, "root");
        assert_eq!(new.database, "my_app");
        assert_eq!(new.instance, "t4g.micro");
        assert_eq!(new.storage_gb, 20);
        assert!(!new.multi_az);
        assert!(new.proxy.is_none());
    }

    #[test]
    fn test_storage_bounds() {
        let mut config = db();
        config.storage = Some(String::from("10 GB"));
        let err = Mysql::resolve(&config, &program(false)).expect_err("too small");
        assert!(err.to_string().contains("at least 20 GB"));

        config.storage = Some(String::from("65 TB"));
        let err = Mysql::resolve(&config, &program(false)).expect_err("too large");
        assert!(err.to_string().contains("65536 GB"));

        config.storage = Some(String::from("64 TB"));
        assert!(Mysql::resolve(&config, &program(false)).is_ok());
    }

    #[test]
    fn test_invalid_database_name() {
        let mut config = db();
        config.database = Some(String::from("My-Db"));
        assert!(Mysql::resolve(&config, &program(false)).is_err());
    }

    #[test]
    fn test_new_mode_requires_subnets() {
        let mut config = db();
        config.vpc = None;
        let err = Mysql::resolve(&config, &program(false)).expect_err("no subnets");
        assert!(err.to_string().contains("vpc.subnets"));
    }

    #[test]
    fn test_mode_selection() {
        let mut config = db();
        config.dev = Some(DevConfig {
            password: Some(String::from("local")),
            ..DevConfig::default()
        });

        let deployed = Mysql::resolve(&config, &program(false)).expect("new");
        assert!(matches!(deployed.mode(), MysqlMode::New(_)));

        let local = Mysql::resolve(&config, &program(true)).expect("dev");
        let MysqlMode::LocalDev(local) = local.mode() else {
            panic!("expected local dev mode");
        };
        assert_eq!(local.host, "localhost");
        assert_eq!(local.port, 3306);
        assert_eq!(local.database, "my_app");
        assert_eq!(local.username, "root");

        config.reference = Some(ReferenceConfig {
            id: String::from("prod-db"),
            proxy_id: None,
        });
        let referenced = Mysql::resolve(&config, &program(true)).expect("reference");
        assert!(matches!(referenced.mode(), MysqlMode::Reference { .. }));
        assert!(referenced.resource_specs().is_empty());
    }

    #[test]
    fn test_dev_mode_needs_password() {
        let mut config = db();
        config.dev = Some(DevConfig::default());
        let err = Mysql::resolve(&config, &program(true)).expect_err("no password");
        assert!(err.to_string().contains("dev.password"));
    }

    #[test]
    fn test_new_mode_resources() {
        let mysql = Mysql::resolve(&db(), &program(false)).expect("resolve");
        assert_eq!(
            names(&mysql),
            vec![
                "DatabasePassword",
                "DatabaseProxySecret",
                "DatabaseProxySecretVersion",
                "DatabaseSubnetGroup",
                "DatabaseParameterGroup",
                "DatabaseInstance",
            ]
        );

        let specs = mysql.resource_specs();
        let instance = specs.iter().find(|s| s.name == "DatabaseInstance").expect("instance");
        assert_eq!(instance.inputs["instanceClass"], json!("db.t4g.micro"));
        assert_eq!(instance.inputs["password"], json!("${DatabasePassword.result}"));
        assert_eq!(instance.inputs["performanceInsightsEnabled"], json!(false));
        assert_eq!(instance.inputs["tags"][PASSWORD_TAG], json!("${DatabaseProxySecret.id}"));

        let group = specs.iter().find(|s| s.name == "DatabaseParameterGroup").expect("group");
        assert_eq!(group.inputs["family"], json!("mysql8.0"));
    }

    #[test]
    fn test_explicit_password_skips_generation() {
        let mut config = db();
        config.password = Some(String::from("hunter2"));
        let mysql = Mysql::resolve(&config, &program(false)).expect("resolve");
        assert!(!names(&mysql).contains(&String::from("DatabasePassword")));
    }

    #[test]
    fn test_proxy_and_replicas() {
        let mut config = db();
        config.replicas = Some(2);
        config.proxy = Some(ProxyConfig::Credentials {
            credentials: vec![ProxyCredential {
                username: String::from("metabase"),
                password: String::from("pw"),
            }],
        });
        let mysql = Mysql::resolve(&config, &program(false)).expect("resolve");
        let specs = mysql.resource_specs();
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();

        for expected in [
            "DatabaseReplica0",
            "DatabaseReplica1",
            "DatabaseProxySecretmetabase",
            "DatabaseProxySecretVersionmetabase",
            "DatabaseProxyRole",
            "DatabaseProxyRoleLookup",
            "DatabaseProxy",
            "DatabaseProxyTargetGroup",
            "DatabaseProxyTarget",
        ] {
            assert!(names.contains(&expected), "missing {expected}");
        }

        let proxy = specs.iter().find(|s| s.name == "DatabaseProxy").expect("proxy");
        assert_eq!(proxy.depends_on, vec![String::from("DatabaseProxyRoleLookup")]);
        assert_eq!(proxy.inputs["auths"].as_array().map(Vec::len), Some(2));

        let replica = specs.iter().find(|s| s.name == "DatabaseReplica1").expect("replica");
        assert_eq!(replica.inputs["dbName"], json!("my_app_replica1"));
        assert_eq!(replica.inputs["replicateSourceDb"], json!("${DatabaseInstance.identifier}"));
    }

    #[test]
    fn test_transform_overrides() {
        let mut config = db();
        let mut overrides = Map::new();
        overrides.insert(String::from("deletionProtection"), json!(true));
        overrides.insert(String::from("storageType"), json!("io1"));
        config.transform.instance = Some(overrides);

        let mysql = Mysql::resolve(&config, &program(false)).expect("resolve");
        let specs = mysql.resource_specs();
        let instance = specs.iter().find(|s| s.name == "DatabaseInstance").expect("instance");
        assert_eq!(instance.inputs["deletionProtection"], json!(true));
        assert_eq!(instance.inputs["storageType"], json!("io1"));
    }

    #[test]
    fn test_replicas_follow_instance_overrides() {
        let mut config = db();
        config.replicas = Some(1);
        let mut overrides = Map::new();
        overrides.insert(String::from("instanceClass"), json!("db.r6g.large"));
        overrides.insert(String::from("storageType"), json!("io1"));
        overrides.insert(String::from("availabilityZone"), json!("us-east-1a"));
        overrides.insert(String::from("dbName"), json!("orders"));
        config.transform.instance = Some(overrides);

        let mysql = Mysql::resolve(&config, &program(false)).expect("resolve");
        let specs = mysql.resource_specs();
        let replica = specs.iter().find(|s| s.name == "DatabaseReplica0").expect("replica");
        assert_eq!(replica.inputs["instanceClass"], json!("db.r6g.large"));
        assert_eq!(replica.inputs["storageType"], json!("io1"));
        assert_eq!(replica.inputs["availabilityZone"], json!("us-east-1a"));
        assert_eq!(replica.inputs["dbName"], json!("orders_replica0"));
        assert_eq!(replica.inputs["engineVersion"], json!(DEFAULT_VERSION));
        assert_eq!(replica.inputs["password"], json!("${DatabasePassword.result}"));
        assert!(replica.inputs.get("multiAz").is_none());
    }

    #[test]
    fn test_user_text_is_not_parsed_as_references() {
        let mut config = db();
        config.password = Some(String::from("pa${ss"));
        let mut overrides = Map::new();
        overrides.insert(String::from("description"), json!("${Other.id}"));
        config.transform.instance = Some(overrides);

        let mysql = Mysql::resolve(&config, &program(false)).expect("resolve");
        let specs = mysql.resource_specs();
        let instance = specs.iter().find(|s| s.name == "DatabaseInstance").expect("instance");
        assert_eq!(instance.inputs["password"], literal("pa${ss"));
        assert_eq!(instance.inputs["description"], literal("${Other.id}"));
        for spec in &specs {
            let deps = spec.dependencies().expect("dependencies");
            assert!(deps.iter().all(|d| d.starts_with("Database")), "{}: {deps:?}", spec.name);
        }
    }

    #[test]
    fn test_proxy_usernames_are_sanitised_in_names() {
        let mut config = db();
        config.proxy = Some(ProxyConfig::Credentials {
            credentials: vec![ProxyCredential {
                username: String::from("svc@host.local"),
                password: String::from("pw"),
            }],
        });
        let mysql = Mysql::resolve(&config, &program(false)).expect("resolve");
        let specs = mysql.resource_specs();
        let secret = specs
            .iter()
            .find(|s| s.name == "DatabaseProxySecretVersionsvc_host_local")
            .expect("credential secret version");
        assert_eq!(
            secret.inputs["secretString"]["$json"]["username"],
            json!("svc@host.local")
        );
        assert!(specs.iter().all(|s| crate::config::is_valid_name(&s.name)), "invalid names");

        config.proxy = Some(ProxyConfig::Credentials {
            credentials: vec![
                ProxyCredential {
                    username: String::from("app.reader"),
                    password: String::from("pw"),
                },
                ProxyCredential {
                    username: String::from("app_reader"),
                    password: String::from("pw"),
                },
            ],
        });
        let err = Mysql::resolve(&config, &program(false)).expect_err("colliding suffixes");
        assert!(err.to_string().contains("app_reader"));
    }

    fn applied(name: &str, resource_type: &str, id: &str, outputs: Value) -> ResourceState {
        let Value::Object(outputs) = outputs else {
            panic!("outputs must be an object");
        };
        ResourceState::new(name, resource_type, id, json!({}), "hash").with_outputs(outputs)
    }

    #[tokio::test]
    async fn test_new_outputs_from_state() {
        let mysql = Mysql::resolve(&db(), &program(false)).expect("resolve");
        let mut snapshot = StateSnapshot::new();
        snapshot.insert(applied(
            "DatabaseInstance",
            "aws:rds:Instance",
            "instance-1",
            json!({
                "identifier": "database-abc",
                "endpoint": "database-abc.rds.local:3306",
                "port": 3306,
                "username": "root",
                "dbName": "my_app",
            }),
        ));
        snapshot.insert(applied(
            "DatabasePassword",
            "random:RandomPassword",
            "pw-1",
            json!({"result": "generated"}),
        ));

        let provider = SimulatedProvider::new();
        let outputs = mysql.outputs(&snapshot, &provider, &provider).await.expect("outputs");
        assert_eq!(outputs.id, "database-abc");
        assert_eq!(outputs.host, "database-abc.rds.local");
        assert_eq!(outputs.password, "generated");
        assert!(matches!(
            outputs.proxy_id(),
            Err(ReconcileError::ProxyNotEnabled { .. })
        ));

        snapshot.insert(applied(
            "DatabaseProxy",
            "aws:rds:Proxy",
            "proxy-1",
            json!({"endpoint": "database.proxy.rds.local"}),
        ));
        let outputs = mysql.outputs(&snapshot, &provider, &provider).await.expect("outputs");
        assert_eq!(outputs.host, "database.proxy.rds.local");
        assert_eq!(outputs.proxy_id(), Ok("proxy-1"));
    }

    #[tokio::test]
    async fn test_new_outputs_before_apply() {
        let mysql = Mysql::resolve(&db(), &program(false)).expect("resolve");
        let provider = SimulatedProvider::new();
        let result = mysql.outputs(&StateSnapshot::new(), &provider, &provider).await;
        assert!(result.is_err());
    }

    fn referenced() -> Mysql {
        let mut config = db();
        config.reference = Some(ReferenceConfig {
            id: String::from("prod-db"),
            proxy_id: None,
        });
        Mysql::resolve(&config, &program(false)).expect("resolve")
    }

    fn existing_instance(provider: &SimulatedProvider, tags: Value) {
        let Value::Object(outputs) = json!({
            "identifier": "prod-db",
            "endpoint": "prod-db.rds.local:3306",
            "port": 3306,
            "username": "admin",
            "dbName": "prod",
            "tags": tags,
        }) else {
            unreachable!()
        };
        provider.insert_existing("aws:rds:Instance", "prod-db", outputs);
    }

    #[tokio::test]
    async fn test_reference_reads_password_secret() {
        let provider = SimulatedProvider::new();
        existing_instance(&provider, json!({PASSWORD_TAG: "secret-1"}));

        let mut secrets = MockSecretStore::new();
        secrets
            .expect_get()
            .withf(|id| id == "secret-1")
            .times(1)
            .returning(|_| Ok(Some(String::from(r#"{"username":"admin","password":"s3cret"}"#))));

        let outputs = referenced()
            .outputs(&StateSnapshot::new(), &provider, &secrets)
            .await
            .expect("outputs");
        assert_eq!(outputs.password, "s3cret");
        assert_eq!(outputs.host, "prod-db.rds.local");
        assert_eq!(outputs.username, "admin");
        assert_eq!(outputs.database, "prod");
    }

    #[tokio::test]
    async fn test_reference_without_password_tag() {
        let provider = SimulatedProvider::new();
        existing_instance(&provider, json!({}));
        let mut secrets = MockSecretStore::new();
        secrets.expect_get().never();

        let err = referenced()
            .outputs(&StateSnapshot::new(), &provider, &secrets)
            .await
            .expect_err("no tag");
        assert_eq!(err.to_string(), "Failed to get password for MySQL Database.");
    }

    #[tokio::test]
    async fn test_local_dev_outputs() {
        let mut config = db();
        config.password = Some(String::from("top"));
        config.dev = Some(DevConfig {
            port: Some(3307),
            ..DevConfig::default()
        });
        let mysql = Mysql::resolve(&config, &program(true)).expect("resolve");
        let provider = SimulatedProvider::new();
        let outputs = mysql
            .outputs(&StateSnapshot::new(), &provider, &provider)
            .await
            .expect("outputs");

        assert_eq!(outputs.id, PLACEHOLDER_ID);
        assert_eq!(outputs.proxy_id(), Ok(PLACEHOLDER_ID));
        assert_eq!(outputs.port, 3307);
        assert_eq!(outputs.password, "top");
        assert_eq!(outputs.link_properties()["port"], json!(3307));
    }
}
