use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
pub struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Commands {
    #[command(about = "Create crd yaml")]
    CreateYaml,
    #[command()]
    Run(ControllerArgs),
}

#[derive(Debug, Clone, Args)]
pub struct ControllerArgs {
    /// Namespace the operator places its managed workloads in.
    #[arg(long, default_value = "app-routing-system")]
    operator_namespace: String,
    #[arg(long)]
    cluster_uid: String,
    #[arg(long)]
    tenant_id: String,
    #[arg(long)]
    subscription_id: Option<String>,
    #[arg(long)]
    resource_group: Option<String>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long, default_value = "AzurePublicCloud")]
    cloud: String,
    /// Client id of the managed identity used for keyvault and DNS access.
    #[arg(long)]
    msi_client_id: Option<String>,
    /// DNS zone resource ids synchronised by the config-driven externalDNS
    /// instances. Public and private zones may be mixed; they are split into
    /// separate instances.
    #[arg(long = "dns-zone-id")]
    dns_zone_ids: Vec<String>,
    #[arg(long, default_value_t = 180)]
    dns_sync_interval_seconds: u64,
    /// Endpoint serving the cluster's default domain certificate. When unset
    /// the cached certificate client and the readiness gate on it are
    /// disabled.
    #[arg(long)]
    default_domain_cert_url: Option<String>,
    /// Directory the default domain certificate is materialised into.
    #[arg(long, default_value = "/etc/app-routing/default-domain-cert")]
    cert_dir: String,
    #[arg(long, default_value_t = 180)]
    resource_enforcer_interval_seconds: u64,
    #[arg(long, default_value_t = false)]
    enable_service_monitor: bool,
    #[arg(long, default_value = "app-routing-operator-leader")]
    lease_name: String,
    #[arg(long, default_value_t = 10)]
    watchdog_interval_seconds: u64,
    #[arg(long, default_value_t = 60)]
    watchdog_min_pod_age_seconds: u64,
    #[arg(long, default_value_t = 60)]
    watchdog_vote_ttl_seconds: u64,
    #[arg(long, default_value_t = 4)]
    watchdog_min_votes: usize,
    #[arg(long, default_value_t = 200.0)]
    watchdog_percent_over_avg: f64,
    #[arg(long, default_value = "0.0.0.0:8080")]
    probe_addr: String,
}

impl ControllerArgs {
    pub fn operator_namespace(&self) -> &str {
        &self.operator_namespace
    }

    pub fn cluster_uid(&self) -> &str {
        &self.cluster_uid
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn subscription_id(&self) -> Option<&String> {
        self.subscription_id.as_ref()
    }

    pub fn resource_group(&self) -> Option<&String> {
        self.resource_group.as_ref()
    }

    pub fn location(&self) -> Option<&String> {
        self.location.as_ref()
    }

    pub fn cloud(&self) -> &str {
        &self.cloud
    }

    pub fn msi_client_id(&self) -> Option<&String> {
        self.msi_client_id.as_ref()
    }

    pub fn dns_zone_ids(&self) -> &[String] {
        &self.dns_zone_ids
    }

    pub fn dns_sync_interval_seconds(&self) -> u64 {
        self.dns_sync_interval_seconds
    }

    pub fn default_domain_cert_url(&self) -> Option<&String> {
        self.default_domain_cert_url.as_ref()
    }

    pub fn cert_dir(&self) -> &str {
        &self.cert_dir
    }

    pub fn resource_enforcer_interval_seconds(&self) -> u64 {
        self.resource_enforcer_interval_seconds
    }

    pub fn enable_service_monitor(&self) -> bool {
        self.enable_service_monitor
    }

    pub fn lease_name(&self) -> &str {
        &self.lease_name
    }

    pub fn watchdog_interval_seconds(&self) -> u64 {
        self.watchdog_interval_seconds
    }

    pub fn watchdog_min_pod_age_seconds(&self) -> u64 {
        self.watchdog_min_pod_age_seconds
    }

    pub fn watchdog_vote_ttl_seconds(&self) -> u64 {
        self.watchdog_vote_ttl_seconds
    }

    pub fn watchdog_min_votes(&self) -> usize {
        self.watchdog_min_votes
    }

    pub fn watchdog_percent_over_avg(&self) -> f64 {
        self.watchdog_percent_over_avg
    }

    pub fn probe_addr(&self) -> &str {
        &self.probe_addr
    }
}

impl Cli {
    pub fn commands(&self) -> &Commands {
        &self.commands
    }
}
