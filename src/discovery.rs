//! Discovery of ambient database endpoints
//!
//! Sources are local docker containers and cloud CLIs that are already
//! configured (`aws`, `gcloud`, `az`). Every source shells out once, parses JSON
//! and maps what it recognizes to a `DiscoveredTarget`. A source that is not
//! installed, fails, times out or prints something unexpected contributes no
//! targets. Discovery never connects and never reads secrets: for containers
//! only the *name* of the environment variable holding the password is kept.

use crate::config::{ConnectionProfile, Endpoint};
use crate::db::{BackendKind, CapabilityDescriptor};
use crate::workers::WorkerPool;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const LOCALHOST: &str = "localhost";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    Docker,
    AwsRds,
    GcloudSql,
    /// Azure Database flexible servers (PostgreSQL and MySQL)
    Azure,
}

impl DiscoverySource {
    pub const ALL: [DiscoverySource; 4] = [
        DiscoverySource::Docker,
        DiscoverySource::AwsRds,
        DiscoverySource::GcloudSql,
        DiscoverySource::Azure,
    ];
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            DiscoverySource::Docker => "docker",
            DiscoverySource::AwsRds => "aws-rds",
            DiscoverySource::GcloudSql => "gcloud-sql",
            DiscoverySource::Azure => "azure",
        })
    }
}

/// A database endpoint found in the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTarget {
    pub source: DiscoverySource,
    /// Container name or cloud instance identifier
    pub name: String,
    pub kind: BackendKind,
    pub host: String,
    /// `None` when no reachable port could be determined
    pub port: Option<u16>,
    pub username: Option<String>,
    pub database: Option<String>,
    /// Environment variable that holds the password (containers only)
    pub password_env: Option<String>,
    /// Free-form origin detail: image, engine version or region
    pub detail: String,
}

impl DiscoveredTarget {
    /// Whether the target has enough to attempt a connection
    pub fn connectable(&self) -> bool {
        self.port.is_some()
    }

    /// Pre-filled profile. The caller still supplies the secret.
    pub fn to_profile(&self) -> ConnectionProfile {
        let port = self
            .port
            .or_else(|| default_port(self.kind))
            .unwrap_or_default();
        let endpoint = match self.kind {
            BackendKind::Turso => Endpoint::Url {
                url: format!("http://{}:{}", self.host, port),
            },
            _ => Endpoint::Tcp {
                host: self.host.clone(),
                port,
            },
        };
        let mut profile = ConnectionProfile::new(self.name.clone(), self.kind, endpoint);
        profile.username = self.username.clone().filter(|u| !u.is_empty());
        profile.database = self.database.clone();
        profile
    }
}

/// Discovery over a set of sources
#[derive(Clone)]
pub struct Discovery {
    pool: WorkerPool,
    sources: Vec<DiscoverySource>,
    timeout: Duration,
}

impl Discovery {
    pub fn new(pool: WorkerPool) -> Self {
        Self {
            pool,
            sources: DiscoverySource::ALL.to_vec(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_sources(mut self, sources: Vec<DiscoverySource>) -> Self {
        self.sources = sources;
        self
    }

    /// Per-command bound
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Lazy, finite stream of targets. Nothing runs until it is polled;
    /// calling `scan` again starts over.
    pub fn scan(&self) -> BoxStream<'static, DiscoveredTarget> {
        let pool = self.pool.clone();
        let timeout = self.timeout;
        stream::iter(self.sources.clone())
            .then(move |source| {
                let pool = pool.clone();
                async move {
                    let found = pool.run(async move { Ok(scan_source(source, timeout).await) });
                    match found.await {
                        Ok(targets) => targets,
                        Err(e) => {
                            tracing::debug!(%source, error = %e, "discovery worker failed");
                            Vec::new()
                        }
                    }
                }
            })
            .flat_map(stream::iter)
            .boxed()
    }
}

async fn scan_source(source: DiscoverySource, timeout: Duration) -> Vec<DiscoveredTarget> {
    let targets = match source {
        DiscoverySource::Docker => scan_docker(timeout).await,
        DiscoverySource::AwsRds => {
            let out = run_cli(
                "aws",
                &["rds", "describe-db-instances", "--output", "json"],
                timeout,
            )
            .await;
            out.map(|bytes| parse_rds_instances(&bytes)).unwrap_or_default()
        }
        DiscoverySource::GcloudSql => {
            let out = run_cli(
                "gcloud",
                &["sql", "instances", "list", "--format=json"],
                timeout,
            )
            .await;
            out.map(|bytes| parse_gcloud_instances(&bytes))
                .unwrap_or_default()
        }
        DiscoverySource::Azure => {
            let mut targets = Vec::new();
            for (service, kind) in [
                ("postgres", BackendKind::Postgresql),
                ("mysql", BackendKind::Mysql),
            ] {
                let out = run_cli(
                    "az",
                    &[service, "flexible-server", "list", "--output", "json"],
                    timeout,
                )
                .await;
                if let Some(bytes) = out {
                    targets.extend(parse_az_servers(&bytes, kind));
                }
            }
            targets
        }
    };
    tracing::debug!(%source, found = targets.len(), "discovery source scanned");
    targets
}

async fn scan_docker(timeout: Duration) -> Vec<DiscoveredTarget> {
    let Some(listing) = run_cli("docker", &["ps", "-q", "--no-trunc"], timeout).await else {
        return Vec::new();
    };
    let listing = String::from_utf8_lossy(&listing);
    let ids: Vec<&str> = listing.split_whitespace().collect();
    if ids.is_empty() {
        return Vec::new();
    }
    let mut args = vec!["inspect"];
    args.extend(ids);
    run_cli("docker", &args, timeout)
        .await
        .map(|bytes| parse_docker_inspect(&bytes))
        .unwrap_or_default()
}

/// Run a CLI and return its stdout when it exits successfully in time
async fn run_cli(program: &str, args: &[&str], timeout: Duration) -> Option<Vec<u8>> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true);
    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) if output.status.success() => Some(output.stdout),
        Ok(Ok(output)) => {
            tracing::debug!(program, status = %output.status, "discovery command failed");
            None
        }
        Ok(Err(e)) => {
            tracing::debug!(program, error = %e, "discovery command unavailable");
            None
        }
        Err(_) => {
            tracing::debug!(program, ?timeout, "discovery command timed out");
            None
        }
    }
}

fn default_port(kind: BackendKind) -> Option<u16> {
    match kind {
        // libsql-server's HTTP listener
        BackendKind::Turso => Some(8080),
        _ => CapabilityDescriptor::builtin(kind).default_port(),
    }
}

// ── docker ────────────────────────────────────────────────────

/// Image substrings, most specific first
const IMAGE_KINDS: &[(&str, BackendKind)] = &[
    ("tursodatabase/libsql-server", BackendKind::Turso),
    ("cockroachdb", BackendKind::Cockroachdb),
    ("clickhouse", BackendKind::Clickhouse),
    ("mariadb", BackendKind::Mariadb),
    ("postgres", BackendKind::Postgresql),
    ("mysql", BackendKind::Mysql),
];

struct EnvRules {
    user: &'static [&'static str],
    password: &'static [&'static str],
    database: &'static [&'static str],
    default_user: Option<&'static str>,
}

fn env_rules(kind: BackendKind) -> EnvRules {
    match kind {
        BackendKind::Postgresql | BackendKind::Supabase => EnvRules {
            user: &["POSTGRES_USER"],
            password: &["POSTGRES_PASSWORD"],
            database: &["POSTGRES_DB"],
            default_user: Some("postgres"),
        },
        BackendKind::Mysql => EnvRules {
            user: &["MYSQL_USER"],
            password: &["MYSQL_PASSWORD", "MYSQL_ROOT_PASSWORD"],
            database: &["MYSQL_DATABASE"],
            default_user: Some("root"),
        },
        BackendKind::Mariadb => EnvRules {
            user: &["MARIADB_USER", "MYSQL_USER"],
            password: &[
                "MARIADB_PASSWORD",
                "MARIADB_ROOT_PASSWORD",
                "MYSQL_PASSWORD",
                "MYSQL_ROOT_PASSWORD",
            ],
            database: &["MARIADB_DATABASE", "MYSQL_DATABASE"],
            default_user: Some("root"),
        },
        BackendKind::Clickhouse => EnvRules {
            user: &["CLICKHOUSE_USER"],
            password: &["CLICKHOUSE_PASSWORD"],
            database: &["CLICKHOUSE_DB"],
            default_user: Some("default"),
        },
        BackendKind::Cockroachdb => EnvRules {
            user: &["COCKROACH_USER"],
            password: &["COCKROACH_PASSWORD"],
            database: &["COCKROACH_DATABASE"],
            default_user: Some("root"),
        },
        BackendKind::Sqlite | BackendKind::Duckdb | BackendKind::Turso => EnvRules {
            user: &[],
            password: &[],
            database: &[],
            default_user: None,
        },
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Container {
    #[serde(default)]
    name: String,
    #[serde(default)]
    config: ContainerConfig,
    #[serde(default)]
    network_settings: NetworkSettings,
    #[serde(default)]
    host_config: HostConfig,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerConfig {
    #[serde(default)]
    image: String,
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    exposed_ports: Option<HashMap<String, serde_json::Value>>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    ports: Option<HashMap<String, Option<Vec<PortBinding>>>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    #[serde(default)]
    host_ip: Option<String>,
    #[serde(default)]
    host_port: Option<String>,
}

#[derive(Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    #[serde(default)]
    network_mode: Option<String>,
}

/// Parse `docker inspect` output
pub fn parse_docker_inspect(json: &[u8]) -> Vec<DiscoveredTarget> {
    let containers: Vec<Container> = match serde_json::from_slice(json) {
        Ok(c) => c,
        Err(e) => {
            tracing::debug!(error = %e, "unexpected docker inspect output");
            return Vec::new();
        }
    };
    containers.iter().filter_map(container_target).collect()
}

fn container_target(container: &Container) -> Option<DiscoveredTarget> {
    let image = container.config.image.to_lowercase();
    let kind = IMAGE_KINDS
        .iter()
        .find(|(pattern, _)| image.contains(pattern))
        .map(|(_, kind)| *kind)?;

    let env: HashMap<&str, &str> = container
        .config
        .env
        .iter()
        .flatten()
        .filter_map(|var| var.split_once('='))
        .collect();
    let first = |names: &[&str]| {
        names
            .iter()
            .find(|n| env.get(*n).is_some_and(|v| !v.is_empty()))
            .map(|n| n.to_string())
    };
    let rules = env_rules(kind);
    let username = first(rules.user)
        .and_then(|var| env.get(var.as_str()).map(|v| v.to_string()))
        .or(rules.default_user.map(str::to_string));
    let database = first(rules.database).and_then(|var| env.get(var.as_str()).map(|v| v.to_string()));

    let (host, port) = container_endpoint(container, default_port(kind));
    Some(DiscoveredTarget {
        source: DiscoverySource::Docker,
        name: container.name.trim_start_matches('/').to_string(),
        kind,
        host,
        port,
        username,
        database,
        password_env: first(rules.password),
        detail: container.config.image.clone(),
    })
}

/// Host address and port reachable from this machine
///
/// The binding for the kind's default port wins, then a sole TCP binding,
/// then for host networking the sole exposed port or the default.
fn container_endpoint(container: &Container, default: Option<u16>) -> (String, Option<u16>) {
    let ports = container.network_settings.ports.as_ref();
    let bindings = |key: &str| {
        ports
            .and_then(|p| p.get(key))
            .and_then(|b| b.as_ref())
            .into_iter()
            .flatten()
    };

    let host_for = |binding: &PortBinding| match binding.host_ip.as_deref() {
        None | Some("" | "0.0.0.0" | "::") => LOCALHOST.to_string(),
        Some(ip) => ip.to_string(),
    };
    let parse = |binding: &PortBinding| {
        binding
            .host_port
            .as_deref()
            .and_then(|p| p.parse::<u16>().ok())
    };

    if let Some(default) = default
        && let Some(binding) = bindings(&format!("{}/tcp", default)).find(|b| parse(*b).is_some())
    {
        return (host_for(binding), parse(binding));
    }

    let mapped: BTreeSet<u16> = ports
        .into_iter()
        .flatten()
        .filter(|(key, _)| key.ends_with("/tcp"))
        .flat_map(|(_, b)| b.iter().flatten())
        .filter_map(parse)
        .collect();
    if mapped.len() == 1 {
        return (LOCALHOST.to_string(), mapped.first().copied());
    }

    if container.host_config.network_mode.as_deref() == Some("host") && default.is_some() {
        let exposed: Vec<u16> = container
            .config
            .exposed_ports
            .iter()
            .flat_map(|p| p.keys())
            .filter_map(|k| k.strip_suffix("/tcp"))
            .filter_map(|p| p.parse().ok())
            .collect();
        let port = match exposed.as_slice() {
            [only] => Some(*only),
            _ => default,
        };
        return (LOCALHOST.to_string(), port);
    }
    (LOCALHOST.to_string(), None)
}

// ── aws rds ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct RdsResponse {
    #[serde(rename = "DBInstances", default)]
    instances: Vec<RdsInstance>,
}

#[derive(Deserialize)]
struct RdsInstance {
    #[serde(rename = "DBInstanceIdentifier")]
    identifier: String,
    #[serde(rename = "Engine", default)]
    engine: String,
    #[serde(rename = "EngineVersion", default)]
    engine_version: String,
    #[serde(rename = "Endpoint")]
    endpoint: Option<RdsEndpoint>,
    #[serde(rename = "MasterUsername")]
    master_username: Option<String>,
    #[serde(rename = "DBName")]
    db_name: Option<String>,
}

#[derive(Deserialize)]
struct RdsEndpoint {
    #[serde(rename = "Address")]
    address: String,
    #[serde(rename = "Port")]
    port: Option<u16>,
}

/// Parse `aws rds describe-db-instances --output json`
pub fn parse_rds_instances(json: &[u8]) -> Vec<DiscoveredTarget> {
    let response: RdsResponse = match serde_json::from_slice(json) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "unexpected aws rds output");
            return Vec::new();
        }
    };
    response
        .instances
        .into_iter()
        .filter_map(|inst| {
            let kind = match inst.engine.as_str() {
                e if e.contains("postgres") => BackendKind::Postgresql,
                "mariadb" => BackendKind::Mariadb,
                e if e.contains("mysql") || e == "aurora" => BackendKind::Mysql,
                _ => return None,
            };
            // Instances still being created have no endpoint yet
            let endpoint = inst.endpoint?;
            Some(DiscoveredTarget {
                source: DiscoverySource::AwsRds,
                name: inst.identifier,
                kind,
                host: endpoint.address,
                port: endpoint.port.or_else(|| default_port(kind)),
                username: inst.master_username,
                database: inst.db_name,
                password_env: None,
                detail: format!("{} {}", inst.engine, inst.engine_version)
                    .trim()
                    .to_string(),
            })
        })
        .collect()
}

// ── gcloud sql ────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudSqlInstance {
    name: String,
    #[serde(default)]
    database_version: String,
    #[serde(default)]
    ip_addresses: Vec<CloudSqlAddress>,
    #[serde(default)]
    region: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CloudSqlAddress {
    #[serde(rename = "type", default)]
    kind: String,
    ip_address: String,
}

/// Parse `gcloud sql instances list --format=json`
pub fn parse_gcloud_instances(json: &[u8]) -> Vec<DiscoveredTarget> {
    let instances: Vec<CloudSqlInstance> = match serde_json::from_slice(json) {
        Ok(i) => i,
        Err(e) => {
            tracing::debug!(error = %e, "unexpected gcloud output");
            return Vec::new();
        }
    };
    instances
        .into_iter()
        .filter_map(|inst| {
            let kind = if inst.database_version.starts_with("POSTGRES") {
                BackendKind::Postgresql
            } else if inst.database_version.starts_with("MYSQL") {
                BackendKind::Mysql
            } else {
                return None;
            };
            let address = inst
                .ip_addresses
                .iter()
                .find(|a| a.kind == "PRIMARY")
                .or_else(|| inst.ip_addresses.first())?;
            Some(DiscoveredTarget {
                source: DiscoverySource::GcloudSql,
                host: address.ip_address.clone(),
                port: default_port(kind),
                username: env_rules(kind).default_user.map(str::to_string),
                database: None,
                password_env: None,
                detail: format!("{} {}", inst.database_version, inst.region)
                    .trim()
                    .to_string(),
                name: inst.name,
                kind,
            })
        })
        .collect()
}

// ── azure ─────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureServer {
    name: String,
    fully_qualified_domain_name: Option<String>,
    administrator_login: Option<String>,
    #[serde(default)]
    version: String,
    #[serde(default)]
    location: String,
    #[serde(default)]
    state: String,
}

/// Parse `az {postgres,mysql} flexible-server list --output json`
pub fn parse_az_servers(json: &[u8], kind: BackendKind) -> Vec<DiscoveredTarget> {
    let servers: Vec<AzureServer> = match serde_json::from_slice(json) {
        Ok(s) => s,
        Err(e) => {
            tracing::debug!(error = %e, "unexpected az output");
            return Vec::new();
        }
    };
    servers
        .into_iter()
        .filter_map(|server| {
            // Stopped or still provisioning servers have no usable FQDN
            if !server.state.is_empty() && server.state != "Ready" {
                return None;
            }
            let host = server.fully_qualified_domain_name?;
            Some(DiscoveredTarget {
                source: DiscoverySource::Azure,
                name: server.name,
                kind,
                host,
                port: default_port(kind),
                username: server.administrator_login,
                database: None,
                password_env: None,
                detail: format!("{} {} {}", kind, server.version, server.location)
                    .trim()
                    .to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSPECT: &str = r#"[
      {
        "Id": "a1",
        "Name": "/pg-dev",
        "Config": {
          "Image": "postgres:16",
          "Env": ["POSTGRES_PASSWORD=secret", "POSTGRES_DB=app", "PATH=/usr/bin"],
          "ExposedPorts": {"5432/tcp": {}}
        },
        "NetworkSettings": {
          "Ports": {"5432/tcp": [{"HostIp": "0.0.0.0", "HostPort": "15432"}]}
        },
        "HostConfig": {"NetworkMode": "bridge"}
      },
      {
        "Id": "b2",
        "Name": "/maria",
        "Config": {
          "Image": "mariadb:11",
          "Env": ["MYSQL_ROOT_PASSWORD=pw", "MYSQL_DATABASE=shop"]
        },
        "NetworkSettings": {"Ports": {"3306/tcp": null}},
        "HostConfig": {"NetworkMode": "bridge"}
      },
      {
        "Id": "c3",
        "Name": "/redis",
        "Config": {"Image": "redis:7", "Env": null},
        "NetworkSettings": {"Ports": {}},
        "HostConfig": {}
      },
      {
        "Id": "d4",
        "Name": "/ch",
        "Config": {"Image": "clickhouse/clickhouse-server", "Env": null, "ExposedPorts": {"8123/tcp": {}, "9000/tcp": {}}},
        "NetworkSettings": {"Ports": {}},
        "HostConfig": {"NetworkMode": "host"}
      }
    ]"#;

    #[test]
    fn docker_containers_map_to_targets() {
        let targets = parse_docker_inspect(INSPECT.as_bytes());
        assert_eq!(targets.len(), 3);

        let pg = &targets[0];
        assert_eq!(pg.name, "pg-dev");
        assert_eq!(pg.kind, BackendKind::Postgresql);
        assert_eq!((pg.host.as_str(), pg.port), ("localhost", Some(15432)));
        assert_eq!(pg.username.as_deref(), Some("postgres"));
        assert_eq!(pg.database.as_deref(), Some("app"));
        assert_eq!(pg.password_env.as_deref(), Some("POSTGRES_PASSWORD"));
    }

    #[test]
    fn mariadb_falls_back_to_mysql_variables() {
        let targets = parse_docker_inspect(INSPECT.as_bytes());
        let maria = &targets[1];
        assert_eq!(maria.kind, BackendKind::Mariadb);
        assert_eq!(maria.username.as_deref(), Some("root"));
        assert_eq!(maria.database.as_deref(), Some("shop"));
        assert_eq!(maria.password_env.as_deref(), Some("MYSQL_ROOT_PASSWORD"));
        assert!(!maria.connectable());
    }

    #[test]
    fn host_network_uses_default_port_when_several_exposed() {
        let targets = parse_docker_inspect(INSPECT.as_bytes());
        let ch = &targets[2];
        assert_eq!(ch.kind, BackendKind::Clickhouse);
        assert_eq!(ch.port, Some(8123));
        assert_eq!(ch.username.as_deref(), Some("default"));
    }

    #[test]
    fn secrets_never_leave_the_container_env() {
        let targets = parse_docker_inspect(INSPECT.as_bytes());
        let debug = format!("{:?}", targets);
        assert!(!debug.contains("secret"));
        assert!(!debug.contains("\"pw\""));
    }

    #[test]
    fn bad_json_yields_nothing() {
        assert!(parse_docker_inspect(b"not json").is_empty());
        assert!(parse_rds_instances(b"{").is_empty());
        assert!(parse_gcloud_instances(b"").is_empty());
        assert!(parse_az_servers(b"null", BackendKind::Mysql).is_empty());
    }

    #[test]
    fn rds_instances_are_parsed() {
        let json = r#"{"DBInstances": [
            {"DBInstanceIdentifier": "orders", "Engine": "aurora-postgresql", "EngineVersion": "15.4",
             "Endpoint": {"Address": "orders.abc.rds.amazonaws.com", "Port": 5432},
             "MasterUsername": "admin", "DBName": "orders"},
            {"DBInstanceIdentifier": "legacy", "Engine": "sqlserver-ex",
             "Endpoint": {"Address": "legacy.rds.amazonaws.com", "Port": 1433}},
            {"DBInstanceIdentifier": "pending", "Engine": "mysql"}
        ]}"#;
        let targets = parse_rds_instances(json.as_bytes());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].kind, BackendKind::Postgresql);
        assert_eq!(targets[0].host, "orders.abc.rds.amazonaws.com");
        assert_eq!(targets[0].username.as_deref(), Some("admin"));
        assert_eq!(targets[0].detail, "aurora-postgresql 15.4");
    }

    #[test]
    fn gcloud_instances_prefer_primary_address() {
        let json = r#"[
            {"name": "analytics", "databaseVersion": "MYSQL_8_0", "region": "europe-west1",
             "ipAddresses": [{"type": "PRIVATE", "ipAddress": "10.0.0.3"},
                             {"type": "PRIMARY", "ipAddress": "34.1.2.3"}]},
            {"name": "mssql", "databaseVersion": "SQLSERVER_2019_STANDARD",
             "ipAddresses": [{"type": "PRIMARY", "ipAddress": "34.9.9.9"}]}
        ]"#;
        let targets = parse_gcloud_instances(json.as_bytes());
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].host, "34.1.2.3");
        assert_eq!(targets[0].port, Some(3306));
        assert_eq!(targets[0].username.as_deref(), Some("root"));
    }

    #[test]
    fn target_prefills_profile() {
        let targets = parse_docker_inspect(INSPECT.as_bytes());
        let profile = targets[0].to_profile();
        assert_eq!(profile.name, "pg-dev");
        assert_eq!(
            profile.endpoint,
            Endpoint::Tcp {
                host: "localhost".into(),
                port: 15432
            }
        );
        assert_eq!(profile.database.as_deref(), Some("app"));
    }

    #[tokio::test]
    async fn scan_with_no_sources_is_empty() {
        let discovery = Discovery::new(WorkerPool::new(1)).with_sources(Vec::new());
        let found: Vec<DiscoveredTarget> = discovery.scan().collect().await;
        assert!(found.is_empty());
    }

    #[test]
    fn azure_flexible_servers_are_parsed() {
        let json = r#"[
            {"name": "billing", "fullyQualifiedDomainName": "billing.postgres.database.azure.com",
             "administratorLogin": "billadmin", "version": "16", "location": "westeurope",
             "state": "Ready"},
            {"name": "paused", "fullyQualifiedDomainName": "paused.postgres.database.azure.com",
             "administratorLogin": "ops", "version": "15", "state": "Stopped"},
            {"name": "creating", "version": "16", "state": ""}
        ]"#;
        let targets = parse_az_servers(json.as_bytes(), BackendKind::Postgresql);
        assert_eq!(targets.len(), 1);
        let billing = &targets[0];
        assert_eq!(billing.source, DiscoverySource::Azure);
        assert_eq!(billing.host, "billing.postgres.database.azure.com");
        assert_eq!(billing.port, default_port(BackendKind::Postgresql));
        assert_eq!(billing.username.as_deref(), Some("billadmin"));
        assert!(billing.detail.ends_with("16 westeurope"));

        let profile = billing.to_profile();
        assert_eq!(profile.name, "billing");
        assert_eq!(profile.username.as_deref(), Some("billadmin"));
    }
}
