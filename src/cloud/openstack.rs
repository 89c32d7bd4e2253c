//! OpenStack REST implementation of [`CloudApi`]
//!
//! Keystone v3 password authentication, Neutron v2.0 (including the LBaaS v1
//! extension under `/v2.0/lb`) and Nova v2.1. Resources of tenants created
//! through [`CloudApi::create_tenant`] are managed with a token scoped to that
//! tenant.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{
    CloudApi, CloudError, FloatingIp, HealthMonitor, HealthMonitorRequest, Keypair, LbPool,
    Member, Network, Persistence, PoolRequest, Port, Router, RuleRequest, SecurityGroup,
    SecurityGroupRule, Server, ServerRequest, Subnet, SubnetRequest, TenantContext, Vip,
    VipRequest,
};
use crate::settings::CloudSettings;

// ============================================================================
// Data structures (pure, no I/O)
// ============================================================================

/// Service endpoints selected from the token catalog
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoints {
    pub identity: String,
    pub network: String,
    pub compute: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEntry {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogEndpoint {
    pub interface: String,
    #[serde(default)]
    pub region: Option<String>,
    pub url: String,
}

#[derive(Debug, Deserialize)]
struct TokenEnvelope {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
    #[serde(default)]
    project: Option<IdName>,
    user: IdName,
    #[serde(default)]
    roles: Vec<IdName>,
}

#[derive(Debug, Clone, Deserialize)]
struct IdName {
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Deserialize)]
struct RouterWire {
    id: String,
    name: String,
    #[serde(default)]
    external_gateway_info: Option<GatewayInfo>,
}

#[derive(Debug, Deserialize)]
struct GatewayInfo {
    network_id: String,
}

impl From<RouterWire> for Router {
    fn from(wire: RouterWire) -> Self {
        Router {
            id: wire.id,
            name: wire.name,
            external_network_id: wire.external_gateway_info.map(|g| g.network_id),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServerStatus {
    id: String,
    name: String,
    status: String,
    #[serde(default, rename = "OS-EXT-SRV-ATTR:instance_name")]
    instance_name: Option<String>,
    #[serde(default, rename = "OS-EXT-SRV-ATTR:host")]
    host: Option<String>,
}

#[derive(Debug, Deserialize)]
struct HostRecord {
    host_name: String,
    service: String,
}

enum Scope<'a> {
    ProjectName { name: &'a str, domain: &'a str },
    ProjectId(&'a str),
}

/// Pick the public endpoint of each service, honouring the region if set
pub fn select_endpoints(
    catalog: &[CatalogEntry],
    region: Option<&str>,
    auth_url: &str,
) -> Result<Endpoints, CloudError> {
    let find = |kind: &str| -> Result<String, CloudError> {
        catalog
            .iter()
            .filter(|entry| entry.kind == kind)
            .flat_map(|entry| entry.endpoints.iter())
            .find(|ep| {
                ep.interface == "public"
                    && region.map_or(true, |r| ep.region.as_deref() == Some(r))
            })
            .map(|ep| ep.url.trim_end_matches('/').to_string())
            .ok_or_else(|| CloudError::Auth(format!("no public {} endpoint in catalog", kind)))
    };

    Ok(Endpoints {
        identity: auth_url.trim_end_matches('/').to_string(),
        network: find("network")?,
        compute: find("compute")?,
    })
}

/// Pull the human readable message out of a Neutron, Nova or Keystone fault
/// body (`{"<FaultName>": {"message": ...}}`), falling back to the raw text.
fn fault_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value.as_object().and_then(|fields| {
                fields.values().find_map(|fault| {
                    fault
                        .get("message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
            })
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Map an unsuccessful HTTP status to a [`CloudError`]
pub fn error_from_status(status: u16, body: &str, kind: &str, id: &str) -> CloudError {
    let message = fault_message(body);
    match status {
        404 => CloudError::NotFound(kind.to_string(), id.to_string()),
        409 => CloudError::Conflict(message),
        400 => CloudError::BadRequest(message),
        401 | 403 => CloudError::Auth(message),
        _ => CloudError::Api { status, message },
    }
}

fn take_field<T: DeserializeOwned>(mut value: Value, key: &str) -> Result<T, CloudError> {
    let field = value
        .get_mut(key)
        .map(Value::take)
        .ok_or_else(|| CloudError::Http(format!("response is missing '{}'", key)))?;
    serde_json::from_value(field).map_err(|e| CloudError::Http(e.to_string()))
}

// ============================================================================
// SBIO: I/O implementation (real HTTP client)
// ============================================================================

pub struct OpenStackCloud {
    client: reqwest::Client,
    endpoints: Endpoints,
    token: String,
    tenant: TenantContext,
    user_id: String,
    role_ids: Vec<String>,
    password: String,
    settings: CloudSettings,
    tenant_tokens: DashMap<String, String>,
}

impl OpenStackCloud {
    /// Authenticate against Keystone and resolve service endpoints
    pub async fn connect(settings: &CloudSettings) -> Result<Self, CloudError> {
        let password = settings
            .password()
            .map_err(|e| CloudError::Auth(e.to_string()))?;
        let client = reqwest::Client::new();
        let scope = Scope::ProjectName {
            name: &settings.project,
            domain: &settings.project_domain,
        };
        let (token, body) = issue_token(&client, settings, &password, scope).await?;
        let endpoints =
            select_endpoints(&body.catalog, settings.region.as_deref(), &settings.auth_url)?;
        let project = body
            .project
            .ok_or_else(|| CloudError::Auth("token is not project scoped".to_string()))?;

        info!(
            "Authenticated as {} in project {} ({})",
            settings.username, project.name, project.id
        );

        Ok(Self {
            client,
            endpoints,
            token,
            tenant: TenantContext {
                id: project.id,
                name: project.name,
            },
            user_id: body.user.id,
            role_ids: body.roles.into_iter().map(|r| r.id).collect(),
            password,
            settings: settings.clone(),
            tenant_tokens: DashMap::new(),
        })
    }

    /// Build a client from an already issued token
    pub fn with_token(
        settings: &CloudSettings,
        endpoints: Endpoints,
        token: String,
        tenant: TenantContext,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints,
            token,
            tenant,
            user_id: String::new(),
            role_ids: Vec::new(),
            password: String::new(),
            settings: settings.clone(),
            tenant_tokens: DashMap::new(),
        }
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn token_for(&self, tenant: &TenantContext) -> String {
        self.tenant_tokens
            .get(&tenant.id)
            .map(|t| t.value().clone())
            .unwrap_or_else(|| self.token.clone())
    }

    fn network_url(&self, path: &str) -> String {
        format!("{}/v2.0/{}", self.endpoints.network, path)
    }

    fn compute_url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoints.compute, path)
    }

    fn identity_url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoints.identity, path)
    }

    async fn call(
        &self,
        method: Method,
        url: String,
        body: Option<Value>,
        token: &str,
        kind: &str,
        id: &str,
    ) -> Result<Value, CloudError> {
        debug!("{} {}", method, url);
        let mut req = self
            .client
            .request(method, &url)
            .header("X-Auth-Token", token)
            .header("Accept", "application/json");
        if let Some(body) = body {
            req = req.json(&body);
        }

        let response = req.send().await.map_err(|e| CloudError::Http(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| CloudError::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(error_from_status(status.as_u16(), &text, kind, id));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| CloudError::Http(e.to_string()))
    }

    async fn delete(&self, url: String, kind: &str, id: &str) -> Result<(), CloudError> {
        self.call(Method::DELETE, url, None, &self.token, kind, id)
            .await
            .map(|_| ())
    }

    async fn server_status(&self, server_id: &str) -> Result<ServerStatus, CloudError> {
        let value = self
            .call(
                Method::GET,
                self.compute_url(&format!("servers/{}", server_id)),
                None,
                &self.token,
                "server",
                server_id,
            )
            .await?;
        take_field(value, "server")
    }

    async fn wait_for_active(&self, server_id: &str) -> Result<ServerStatus, CloudError> {
        let deadline = Instant::now() + self.settings.build_timeout();
        let interval = Duration::from_secs(self.settings.build_interval_secs.max(1));
        loop {
            let server = self.server_status(server_id).await?;
            match server.status.as_str() {
                "ACTIVE" => return Ok(server),
                "ERROR" => {
                    return Err(CloudError::ResourceError(
                        "server".to_string(),
                        server_id.to_string(),
                    ))
                }
                status => debug!("Server {} is {}", server_id, status),
            }
            if Instant::now() >= deadline {
                return Err(CloudError::Timeout(
                    "server".to_string(),
                    server_id.to_string(),
                    "ACTIVE".to_string(),
                ));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

async fn issue_token(
    client: &reqwest::Client,
    settings: &CloudSettings,
    password: &str,
    scope: Scope<'_>,
) -> Result<(String, TokenBody), CloudError> {
    let project = match scope {
        Scope::ProjectName { name, domain } => json!({"name": name, "domain": {"name": domain}}),
        Scope::ProjectId(id) => json!({"id": id}),
    };
    let body = json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": settings.username,
                        "domain": {"name": settings.user_domain},
                        "password": password,
                    }
                }
            },
            "scope": {"project": project}
        }
    });

    let url = format!("{}/auth/tokens", settings.auth_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .map_err(|e| CloudError::Http(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let text = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        return Err(CloudError::Auth(format!("{} - {}", status.as_u16(), fault_message(&text))));
    }

    let token = response
        .headers()
        .get("X-Subject-Token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| CloudError::Auth("response carries no X-Subject-Token".to_string()))?;
    let envelope: TokenEnvelope = response
        .json()
        .await
        .map_err(|e| CloudError::Http(e.to_string()))?;

    Ok((token, envelope.token))
}

#[async_trait]
impl CloudApi for OpenStackCloud {
    async fn current_tenant(&self) -> Result<TenantContext, CloudError> {
        Ok(self.tenant.clone())
    }

    async fn create_tenant(&self, name: &str) -> Result<TenantContext, CloudError> {
        let value = self
            .call(
                Method::POST,
                self.identity_url("projects"),
                Some(json!({"project": {"name": name, "enabled": true}})),
                &self.token,
                "project",
                name,
            )
            .await?;
        let project: IdName = take_field(value, "project")?;

        for role_id in &self.role_ids {
            self.call(
                Method::PUT,
                self.identity_url(&format!(
                    "projects/{}/users/{}/roles/{}",
                    project.id, self.user_id, role_id
                )),
                None,
                &self.token,
                "role",
                role_id,
            )
            .await?;
        }

        let (token, _) = issue_token(
            &self.client,
            &self.settings,
            &self.password,
            Scope::ProjectId(&project.id),
        )
        .await?;
        self.tenant_tokens.insert(project.id.clone(), token);

        info!("Created tenant {} ({})", name, project.id);
        Ok(TenantContext {
            id: project.id,
            name: name.to_string(),
        })
    }

    async fn delete_tenant(&self, tenant_id: &str) -> Result<(), CloudError> {
        self.tenant_tokens.remove(tenant_id);
        self.delete(
            self.identity_url(&format!("projects/{}", tenant_id)),
            "project",
            tenant_id,
        )
        .await
    }

    async fn create_router(
        &self,
        tenant: &TenantContext,
        name: &str,
        external_network_id: Option<&str>,
    ) -> Result<Router, CloudError> {
        let mut router = json!({"name": name, "tenant_id": tenant.id});
        if let Some(network_id) = external_network_id {
            router["external_gateway_info"] = json!({"network_id": network_id});
        }
        let value = self
            .call(
                Method::POST,
                self.network_url("routers"),
                Some(json!({"router": router})),
                &self.token_for(tenant),
                "router",
                name,
            )
            .await?;
        take_field::<RouterWire>(value, "router").map(Router::from)
    }

    async fn get_router(&self, router_id: &str) -> Result<Router, CloudError> {
        let value = self
            .call(
                Method::GET,
                self.network_url(&format!("routers/{}", router_id)),
                None,
                &self.token,
                "router",
                router_id,
            )
            .await?;
        take_field::<RouterWire>(value, "router").map(Router::from)
    }

    async fn delete_router(&self, router_id: &str) -> Result<(), CloudError> {
        self.delete(
            self.network_url(&format!("routers/{}", router_id)),
            "router",
            router_id,
        )
        .await
    }

    async fn add_router_interface(
        &self,
        router_id: &str,
        subnet_id: &str,
    ) -> Result<(), CloudError> {
        self.call(
            Method::PUT,
            self.network_url(&format!("routers/{}/add_router_interface", router_id)),
            Some(json!({"subnet_id": subnet_id})),
            &self.token,
            "router",
            router_id,
        )
        .await
        .map(|_| ())
    }

    async fn remove_router_interface(
        &self,
        router_id: &str,
        subnet_id: &str,
    ) -> Result<(), CloudError> {
        self.call(
            Method::PUT,
            self.network_url(&format!("routers/{}/remove_router_interface", router_id)),
            Some(json!({"subnet_id": subnet_id})),
            &self.token,
            "router interface",
            subnet_id,
        )
        .await
        .map(|_| ())
    }

    async fn create_network(
        &self,
        tenant: &TenantContext,
        name: &str,
    ) -> Result<Network, CloudError> {
        let value = self
            .call(
                Method::POST,
                self.network_url("networks"),
                Some(json!({"network": {"name": name, "tenant_id": tenant.id}})),
                &self.token_for(tenant),
                "network",
                name,
            )
            .await?;
        take_field(value, "network")
    }

    async fn get_network(&self, network_id: &str) -> Result<Network, CloudError> {
        let value = self
            .call(
                Method::GET,
                self.network_url(&format!("networks/{}", network_id)),
                None,
                &self.token,
                "network",
                network_id,
            )
            .await?;
        take_field(value, "network")
    }

    async fn delete_network(&self, network_id: &str) -> Result<(), CloudError> {
        self.delete(
            self.network_url(&format!("networks/{}", network_id)),
            "network",
            network_id,
        )
        .await
    }

    async fn create_subnet(
        &self,
        tenant: &TenantContext,
        request: &SubnetRequest,
    ) -> Result<Subnet, CloudError> {
        let mut subnet =
            serde_json::to_value(request).map_err(|e| CloudError::Http(e.to_string()))?;
        subnet["tenant_id"] = json!(tenant.id);
        let value = self
            .call(
                Method::POST,
                self.network_url("subnets"),
                Some(json!({"subnet": subnet})),
                &self.token_for(tenant),
                "subnet",
                &request.name,
            )
            .await?;
        take_field(value, "subnet")
    }

    async fn delete_subnet(&self, subnet_id: &str) -> Result<(), CloudError> {
        self.delete(
            self.network_url(&format!("subnets/{}", subnet_id)),
            "subnet",
            subnet_id,
        )
        .await
    }

    async fn list_security_groups(
        &self,
        tenant: &TenantContext,
    ) -> Result<Vec<SecurityGroup>, CloudError> {
        let value = self
            .call(
                Method::GET,
                self.network_url(&format!("security-groups?tenant_id={}", tenant.id)),
                None,
                &self.token_for(tenant),
                "security groups of tenant",
                &tenant.id,
            )
            .await?;
        take_field(value, "security_groups")
    }

    async fn create_security_group(
        &self,
        tenant: &TenantContext,
        name: &str,
    ) -> Result<SecurityGroup, CloudError> {
        let value = self
            .call(
                Method::POST,
                self.network_url("security-groups"),
                Some(json!({"security_group": {"name": name, "tenant_id": tenant.id}})),
                &self.token_for(tenant),
                "security group",
                name,
            )
            .await?;
        take_field(value, "security_group")
    }

    async fn delete_security_group(&self, group_id: &str) -> Result<(), CloudError> {
        self.delete(
            self.network_url(&format!("security-groups/{}", group_id)),
            "security group",
            group_id,
        )
        .await
    }

    async fn create_security_group_rule(
        &self,
        tenant: &TenantContext,
        request: &RuleRequest,
    ) -> Result<SecurityGroupRule, CloudError> {
        let mut rule = serde_json::to_value(request).map_err(|e| CloudError::Http(e.to_string()))?;
        rule["tenant_id"] = json!(tenant.id);
        let value = self
            .call(
                Method::POST,
                self.network_url("security-group-rules"),
                Some(json!({"security_group_rule": rule})),
                &self.token_for(tenant),
                "security group",
                &request.security_group_id,
            )
            .await?;
        take_field(value, "security_group_rule")
    }

    async fn delete_security_group_rule(&self, rule_id: &str) -> Result<(), CloudError> {
        self.delete(
            self.network_url(&format!("security-group-rules/{}", rule_id)),
            "security group rule",
            rule_id,
        )
        .await
    }

    async fn create_keypair(&self, name: &str) -> Result<Keypair, CloudError> {
        let value = self
            .call(
                Method::POST,
                self.compute_url("os-keypairs"),
                Some(json!({"keypair": {"name": name}})),
                &self.token,
                "keypair",
                name,
            )
            .await?;
        take_field(value, "keypair")
    }

    async fn delete_keypair(&self, name: &str) -> Result<(), CloudError> {
        self.delete(
            self.compute_url(&format!("os-keypairs/{}", name)),
            "keypair",
            name,
        )
        .await
    }

    async fn create_server(
        &self,
        tenant: &TenantContext,
        request: &ServerRequest,
    ) -> Result<Server, CloudError> {
        let networks: Vec<Value> = request
            .network_ids
            .iter()
            .map(|id| json!({"uuid": id}))
            .collect();
        let security_groups: Vec<Value> = request
            .security_groups
            .iter()
            .map(|name| json!({"name": name}))
            .collect();
        let body = json!({
            "server": {
                "name": request.name,
                "imageRef": request.image_ref,
                "flavorRef": request.flavor_ref,
                "key_name": request.key_name,
                "networks": networks,
                "security_groups": security_groups,
            }
        });

        let value = self
            .call(
                Method::POST,
                self.compute_url("servers"),
                Some(body),
                &self.token_for(tenant),
                "server",
                &request.name,
            )
            .await?;
        let created: IdName = take_field(value, "server")?;
        let active = self.wait_for_active(&created.id).await?;

        let mut ports = self.list_ports(&active.id).await?;
        ports.sort_by_key(|port| {
            request
                .network_ids
                .iter()
                .position(|id| *id == port.network_id)
                .unwrap_or(usize::MAX)
        });

        Ok(Server {
            id: active.id,
            name: active.name,
            status: active.status,
            instance_name: active.instance_name,
            ports,
        })
    }

    async fn delete_server(&self, server_id: &str) -> Result<(), CloudError> {
        self.delete(
            self.compute_url(&format!("servers/{}", server_id)),
            "server",
            server_id,
        )
        .await?;

        // Ports are released only once the server is gone
        let deadline = Instant::now() + self.settings.build_timeout();
        loop {
            match self.server_status(server_id).await {
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
                Ok(_) if Instant::now() >= deadline => {
                    return Err(CloudError::Timeout(
                        "server".to_string(),
                        server_id.to_string(),
                        "DELETED".to_string(),
                    ))
                }
                Ok(_) => {
                    tokio::time::sleep(Duration::from_secs(
                        self.settings.build_interval_secs.max(1),
                    ))
                    .await
                }
            }
        }
    }

    async fn list_compute_hosts(&self) -> Result<Vec<String>, CloudError> {
        let value = self
            .call(
                Method::GET,
                self.compute_url("os-hosts"),
                None,
                &self.token,
                "hosts",
                "",
            )
            .await?;
        let hosts: Vec<HostRecord> = take_field(value, "hosts")?;
        Ok(hosts
            .into_iter()
            .filter(|h| h.service == "compute")
            .map(|h| h.host_name)
            .collect())
    }

    async fn server_host(&self, server_id: &str) -> Result<String, CloudError> {
        self.server_status(server_id).await?.host.ok_or_else(|| {
            CloudError::Auth(format!(
                "hypervisor of server {} is only visible to admin credentials",
                server_id
            ))
        })
    }

    async fn live_migrate_server(
        &self,
        server_id: &str,
        host: &str,
        block_migration: bool,
    ) -> Result<(), CloudError> {
        let body = json!({
            "os-migrateLive": {
                "host": host,
                "block_migration": block_migration,
                "disk_over_commit": false,
            }
        });
        self.call(
            Method::POST,
            self.compute_url(&format!("servers/{}/action", server_id)),
            Some(body),
            &self.token,
            "server",
            server_id,
        )
        .await?;
        info!("Live migrating server {} to {}", server_id, host);
        self.wait_for_active(server_id).await?;
        Ok(())
    }

    async fn list_ports(&self, device_id: &str) -> Result<Vec<Port>, CloudError> {
        let value = self
            .call(
                Method::GET,
                self.network_url(&format!("ports?device_id={}", device_id)),
                None,
                &self.token,
                "ports of device",
                device_id,
            )
            .await?;
        take_field(value, "ports")
    }

    async fn set_port_admin_state(&self, port_id: &str, up: bool) -> Result<Port, CloudError> {
        let value = self
            .call(
                Method::PUT,
                self.network_url(&format!("ports/{}", port_id)),
                Some(json!({"port": {"admin_state_up": up}})),
                &self.token,
                "port",
                port_id,
            )
            .await?;
        take_field(value, "port")
    }

    async fn create_floating_ip(
        &self,
        tenant: &TenantContext,
        external_network_id: &str,
        port_id: &str,
    ) -> Result<FloatingIp, CloudError> {
        let body = json!({
            "floatingip": {
                "floating_network_id": external_network_id,
                "port_id": port_id,
                "tenant_id": tenant.id,
            }
        });
        let value = self
            .call(
                Method::POST,
                self.network_url("floatingips"),
                Some(body),
                &self.token_for(tenant),
                "floating ip for port",
                port_id,
            )
            .await?;
        take_field(value, "floatingip")
    }

    async fn delete_floating_ip(&self, floating_ip_id: &str) -> Result<(), CloudError> {
        self.delete(
            self.network_url(&format!("floatingips/{}", floating_ip_id)),
            "floating ip",
            floating_ip_id,
        )
        .await
    }

    async fn create_pool(
        &self,
        tenant: &TenantContext,
        request: &PoolRequest,
    ) -> Result<LbPool, CloudError> {
        let mut pool = serde_json::to_value(request).map_err(|e| CloudError::Http(e.to_string()))?;
        pool["tenant_id"] = json!(tenant.id);
        let value = self
            .call(
                Method::POST,
                self.network_url("lb/pools"),
                Some(json!({"pool": pool})),
                &self.token_for(tenant),
                "pool",
                &request.name,
            )
            .await?;
        take_field(value, "pool")
    }

    async fn delete_pool(&self, pool_id: &str) -> Result<(), CloudError> {
        self.delete(
            self.network_url(&format!("lb/pools/{}", pool_id)),
            "pool",
            pool_id,
        )
        .await
    }

    async fn create_member(
        &self,
        tenant: &TenantContext,
        pool_id: &str,
        address: &str,
        protocol_port: u16,
    ) -> Result<Member, CloudError> {
        let body = json!({
            "member": {
                "pool_id": pool_id,
                "address": address,
                "protocol_port": protocol_port,
                "tenant_id": tenant.id,
            }
        });
        let value = self
            .call(
                Method::POST,
                self.network_url("lb/members"),
                Some(body),
                &self.token_for(tenant),
                "member",
                address,
            )
            .await?;
        take_field(value, "member")
    }

    async fn delete_member(&self, member_id: &str) -> Result<(), CloudError> {
        self.delete(
            self.network_url(&format!("lb/members/{}", member_id)),
            "member",
            member_id,
        )
        .await
    }

    async fn create_vip(
        &self,
        tenant: &TenantContext,
        request: &VipRequest,
    ) -> Result<Vip, CloudError> {
        let mut vip = serde_json::to_value(request).map_err(|e| CloudError::Http(e.to_string()))?;
        vip["tenant_id"] = json!(tenant.id);
        let value = self
            .call(
                Method::POST,
                self.network_url("lb/vips"),
                Some(json!({"vip": vip})),
                &self.token_for(tenant),
                "vip",
                &request.name,
            )
            .await?;
        take_field(value, "vip")
    }

    async fn update_vip_persistence(
        &self,
        vip_id: &str,
        persistence: Option<Persistence>,
    ) -> Result<Vip, CloudError> {
        let value = self
            .call(
                Method::PUT,
                self.network_url(&format!("lb/vips/{}", vip_id)),
                Some(json!({"vip": {"session_persistence": persistence}})),
                &self.token,
                "vip",
                vip_id,
            )
            .await?;
        take_field(value, "vip")
    }

    async fn delete_vip(&self, vip_id: &str) -> Result<(), CloudError> {
        self.delete(
            self.network_url(&format!("lb/vips/{}", vip_id)),
            "vip",
            vip_id,
        )
        .await
    }

    async fn create_health_monitor(
        &self,
        tenant: &TenantContext,
        request: &HealthMonitorRequest,
    ) -> Result<HealthMonitor, CloudError> {
        let mut monitor =
            serde_json::to_value(request).map_err(|e| CloudError::Http(e.to_string()))?;
        monitor["tenant_id"] = json!(tenant.id);
        let value = self
            .call(
                Method::POST,
                self.network_url("lb/health_monitors"),
                Some(json!({"health_monitor": monitor})),
                &self.token_for(tenant),
                "health monitor",
                &request.kind,
            )
            .await?;
        take_field(value, "health_monitor")
    }

    async fn associate_health_monitor(
        &self,
        health_monitor_id: &str,
        pool_id: &str,
    ) -> Result<(), CloudError> {
        self.call(
            Method::POST,
            self.network_url(&format!("lb/pools/{}/health_monitors", pool_id)),
            Some(json!({"health_monitor": {"id": health_monitor_id}})),
            &self.token,
            "pool",
            pool_id,
        )
        .await
        .map(|_| ())
    }

    async fn disassociate_health_monitor(
        &self,
        health_monitor_id: &str,
        pool_id: &str,
    ) -> Result<(), CloudError> {
        self.delete(
            self.network_url(&format!(
                "lb/pools/{}/health_monitors/{}",
                pool_id, health_monitor_id
            )),
            "health monitor association",
            health_monitor_id,
        )
        .await
    }

    async fn delete_health_monitor(&self, health_monitor_id: &str) -> Result<(), CloudError> {
        self.delete(
            self.network_url(&format!("lb/health_monitors/{}", health_monitor_id)),
            "health monitor",
            health_monitor_id,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{Direction, LbMethod};
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tenant() -> TenantContext {
        TenantContext {
            id: "tenant-1".to_string(),
            name: "demo".to_string(),
        }
    }

    fn cloud_for(server: &MockServer) -> OpenStackCloud {
        let endpoints = Endpoints {
            identity: format!("{}/v3", server.uri()),
            network: server.uri(),
            compute: format!("{}/v2.1", server.uri()),
        };
        OpenStackCloud::with_token(
            &CloudSettings::default(),
            endpoints,
            "tok".to_string(),
            tenant(),
        )
    }

    #[test]
    fn test_select_endpoints_by_region() {
        let catalog: Vec<CatalogEntry> = serde_json::from_value(json!([
            {"type": "network", "endpoints": [
                {"interface": "public", "region": "RegionTwo", "url": "http://two:9696"},
                {"interface": "internal", "region": "RegionOne", "url": "http://internal:9696"},
                {"interface": "public", "region": "RegionOne", "url": "http://one:9696/"}
            ]},
            {"type": "compute", "endpoints": [
                {"interface": "public", "region": "RegionOne", "url": "http://one:8774/v2.1"}
            ]}
        ]))
        .unwrap();

        let endpoints =
            select_endpoints(&catalog, Some("RegionOne"), "http://keystone:5000/v3/").unwrap();
        assert_eq!(endpoints.network, "http://one:9696");
        assert_eq!(endpoints.compute, "http://one:8774/v2.1");
        assert_eq!(endpoints.identity, "http://keystone:5000/v3");
    }

    #[test]
    fn test_select_endpoints_missing_service() {
        let result = select_endpoints(&[], None, "http://keystone:5000/v3");
        assert!(matches!(result, Err(CloudError::Auth(_))));
    }

    #[test]
    fn test_error_from_status() {
        let body = json!({
            "NeutronError": {
                "type": "SecurityGroupRuleExists",
                "message": "Security group rule already exists. Rule id is abc.",
                "detail": ""
            }
        })
        .to_string();
        let err = error_from_status(409, &body, "security group", "sg");
        assert!(err.is_already_exists());

        let err = error_from_status(404, "", "router", "r1");
        assert_eq!(err, CloudError::NotFound("router".to_string(), "r1".to_string()));

        let err = error_from_status(500, "boom", "router", "r1");
        assert_eq!(
            err,
            CloudError::Api {
                status: 500,
                message: "boom".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_connect_reads_token_and_catalog() {
        let server = MockServer::start().await;
        let token_body = json!({
            "token": {
                "project": {"id": "p-1", "name": "demo"},
                "user": {"id": "u-1", "name": "admin"},
                "roles": [{"id": "r-1", "name": "admin"}],
                "catalog": [
                    {"type": "network", "endpoints": [
                        {"interface": "public", "region": "RegionOne",
                         "url": format!("{}/net", server.uri())}
                    ]},
                    {"type": "compute", "endpoints": [
                        {"interface": "public", "region": "RegionOne",
                         "url": format!("{}/compute", server.uri())}
                    ]}
                ]
            }
        });
        Mock::given(method("POST"))
            .and(path("/v3/auth/tokens"))
            .and(body_partial_json(json!({"auth": {"scope": {"project": {"name": "demo"}}}})))
            .respond_with(
                ResponseTemplate::new(201)
                    .insert_header("X-Subject-Token", "secret-token")
                    .set_body_json(token_body),
            )
            .mount(&server)
            .await;

        std::env::set_var("NETSCENARIO_TEST_OS_PASSWORD", "pw");
        let settings = CloudSettings {
            auth_url: format!("{}/v3", server.uri()),
            project: "demo".to_string(),
            password_env: "NETSCENARIO_TEST_OS_PASSWORD".to_string(),
            ..CloudSettings::default()
        };

        let cloud = OpenStackCloud::connect(&settings).await.unwrap();
        assert_eq!(cloud.endpoints().network, format!("{}/net", server.uri()));
        let tenant = cloud.current_tenant().await.unwrap();
        assert_eq!(tenant.id, "p-1");
    }

    #[tokio::test]
    async fn test_create_network_sends_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.0/networks"))
            .and(header("X-Auth-Token", "tok"))
            .and(body_partial_json(json!({"network": {"name": "net-a", "tenant_id": "tenant-1"}})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "network": {"id": "n-1", "name": "net-a", "subnets": []}
            })))
            .mount(&server)
            .await;

        let cloud = cloud_for(&server);
        let network = cloud.create_network(&tenant(), "net-a").await.unwrap();
        assert_eq!(network.id, "n-1");
        assert!(network.subnet_ids.is_empty());
    }

    #[tokio::test]
    async fn test_create_router_with_gateway() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.0/routers"))
            .and(body_partial_json(json!({
                "router": {"external_gateway_info": {"network_id": "ext"}}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "router": {"id": "r-1", "name": "router-public",
                           "external_gateway_info": {"network_id": "ext"}}
            })))
            .mount(&server)
            .await;

        let cloud = cloud_for(&server);
        let router = cloud
            .create_router(&tenant(), "router-public", Some("ext"))
            .await
            .unwrap();
        assert_eq!(router.external_network_id.as_deref(), Some("ext"));
    }

    #[tokio::test]
    async fn test_delete_missing_resource_is_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/v2.0/subnets/s-404"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "NeutronError": {"message": "Subnet s-404 could not be found"}
            })))
            .mount(&server)
            .await;

        let cloud = cloud_for(&server);
        let err = cloud.delete_subnet("s-404").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_duplicate_rule_is_conflict() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.0/security-group-rules"))
            .respond_with(ResponseTemplate::new(409).set_body_json(json!({
                "NeutronError": {"message": "Security group rule already exists. Rule id is x."}
            })))
            .mount(&server)
            .await;

        let cloud = cloud_for(&server);
        let request = RuleRequest {
            security_group_id: "sg-1".to_string(),
            direction: Direction::Egress,
            ethertype: "IPv4".to_string(),
            protocol: None,
            port_range_min: None,
            port_range_max: None,
            remote_ip_prefix: None,
        };
        let err = cloud
            .create_security_group_rule(&tenant(), &request)
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn test_create_server_waits_for_active_and_orders_ports() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.1/servers"))
            .and(body_partial_json(json!({
                "server": {"networks": [{"uuid": "n-a"}, {"uuid": "n-b"}]}
            })))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "server": {"id": "srv-1"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2.1/servers/srv-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "server": {"id": "srv-1", "name": "backend-1", "status": "ACTIVE"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2.0/ports"))
            .and(query_param("device_id", "srv-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "ports": [
                    {"id": "p-b", "network_id": "n-b", "device_id": "srv-1",
                     "fixed_ips": [{"subnet_id": "s-b", "ip_address": "10.0.1.5"}],
                     "admin_state_up": true},
                    {"id": "p-a", "network_id": "n-a", "device_id": "srv-1",
                     "fixed_ips": [{"subnet_id": "s-a", "ip_address": "10.0.0.5"}],
                     "admin_state_up": true}
                ]
            })))
            .mount(&server)
            .await;

        let cloud = cloud_for(&server);
        let request = ServerRequest {
            name: "backend-1".to_string(),
            image_ref: "img".to_string(),
            flavor_ref: "1".to_string(),
            key_name: "kp".to_string(),
            network_ids: vec!["n-a".to_string(), "n-b".to_string()],
            security_groups: vec!["sg".to_string()],
        };
        let created = cloud.create_server(&tenant(), &request).await.unwrap();
        assert_eq!(created.status, "ACTIVE");
        assert_eq!(created.ports[0].id, "p-a");
        assert_eq!(created.ports[1].id, "p-b");
    }

    #[tokio::test]
    async fn test_server_error_state() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.1/servers"))
            .respond_with(ResponseTemplate::new(202).set_body_json(json!({
                "server": {"id": "srv-err"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2.1/servers/srv-err"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "server": {"id": "srv-err", "name": "x", "status": "ERROR"}
            })))
            .mount(&server)
            .await;

        let cloud = cloud_for(&server);
        let request = ServerRequest {
            name: "x".to_string(),
            image_ref: "img".to_string(),
            flavor_ref: "1".to_string(),
            key_name: "kp".to_string(),
            network_ids: vec!["n-a".to_string()],
            security_groups: vec![],
        };
        let err = cloud.create_server(&tenant(), &request).await.unwrap_err();
        assert!(matches!(err, CloudError::ResourceError(_, _)));
    }

    #[tokio::test]
    async fn test_pool_and_vip_persistence() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.0/lb/pools"))
            .and(body_partial_json(json!({
                "pool": {"lb_method": "ROUND_ROBIN", "protocol": "TCP"}
            })))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "pool": {"id": "pool-1", "name": "pool", "subnet_id": "s-1",
                         "lb_method": "ROUND_ROBIN"}
            })))
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/v2.0/lb/vips/vip-1"))
            .and(body_partial_json(json!({"vip": {"session_persistence": {"type": "SOURCE_IP"}}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "vip": {"id": "vip-1", "address": "10.0.0.100", "pool_id": "pool-1",
                        "protocol_port": 8080, "session_persistence": {"type": "SOURCE_IP"}}
            })))
            .mount(&server)
            .await;

        let cloud = cloud_for(&server);
        let pool = cloud
            .create_pool(
                &tenant(),
                &PoolRequest {
                    name: "pool".to_string(),
                    subnet_id: "s-1".to_string(),
                    lb_method: LbMethod::RoundRobin,
                    protocol: "TCP".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(pool.id, "pool-1");

        let vip = cloud
            .update_vip_persistence("vip-1", Some(Persistence::SourceIp))
            .await
            .unwrap();
        assert_eq!(vip.session_persistence, Some(Persistence::SourceIp));
    }

    #[tokio::test]
    async fn test_compute_hosts_filters_other_services() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.1/os-hosts"))
            .and(header("X-Auth-Token", "tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "hosts": [
                    {"host_name": "ctl-1", "service": "scheduler", "zone": "internal"},
                    {"host_name": "cmp-1", "service": "compute", "zone": "nova"},
                    {"host_name": "cmp-2", "service": "compute", "zone": "nova"}
                ]
            })))
            .mount(&server)
            .await;

        let hosts = cloud_for(&server).list_compute_hosts().await.unwrap();
        assert_eq!(hosts, vec!["cmp-1", "cmp-2"]);
    }

    #[tokio::test]
    async fn test_live_migrate_waits_for_active() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v2.1/servers/srv-1/action"))
            .and(body_partial_json(json!({
                "os-migrateLive": {"host": "cmp-2", "block_migration": true}
            })))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v2.1/servers/srv-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "server": {"id": "srv-1", "name": "vm", "status": "ACTIVE",
                           "OS-EXT-SRV-ATTR:host": "cmp-2"}
            })))
            .mount(&server)
            .await;

        let cloud = cloud_for(&server);
        cloud.live_migrate_server("srv-1", "cmp-2", true).await.unwrap();
        assert_eq!(cloud.server_host("srv-1").await.unwrap(), "cmp-2");
    }

    #[tokio::test]
    async fn test_server_host_hidden_from_tenant() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v2.1/servers/srv-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "server": {"id": "srv-1", "name": "vm", "status": "ACTIVE"}
            })))
            .mount(&server)
            .await;

        let err = cloud_for(&server).server_host("srv-1").await.unwrap_err();
        assert!(matches!(err, CloudError::Auth(_)));
    }
}
