use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "polygov")]
#[command(about = "Kubernetes policy governance engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Check cluster connectivity and permissions
    Check,

    /// List Kubernetes resources (e.g. pods)
    List {
        /// Resource type to list (pods)
        resource: String,
    },

    /// Bring up the inventory sync watcher pool
    Watch,

    /// Manage the policy-resource CRDs (ConstraintTemplate, Constraint, Mutator, ...)
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Run the policy reconcile loop and periodic audit pass
    Reconcile,

    /// Manage the admission/mutation webhook
    Webhook {
        #[command(subcommand)]
        action: WebhookAction,
    },

    /// Generate observability manifests (Services, ServiceMonitors, Grafana dashboard)
    Observability {
        #[command(subcommand)]
        action: ObservabilityAction,
    },
}

#[derive(Subcommand)]
pub enum WebhookAction {
    /// Start the admission/mutation webhook HTTPS server
    Serve {
        #[arg(long, default_value = "0.0.0.0:8443")]
        addr: String,
        #[arg(long, default_value = "tls.crt")]
        tls_cert: String,
        #[arg(long, default_value = "tls.key")]
        tls_key: String,
    },
    /// Generate self-signed TLS certificates for development
    CertGenerate {
        #[arg(long, default_value = "polygov-webhook")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long, default_value = ".")]
        output_dir: String,
        /// Additional IP SANs (e.g. --ip-san 192.168.1.26)
        #[arg(long = "ip-san")]
        ip_sans: Vec<String>,
    },
    /// Print the Validating/MutatingWebhookConfiguration YAML
    InstallConfig {
        #[arg(long, default_value = "polygov-webhook")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long)]
        ca_bundle_path: String,
    },
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print every policy-resource CRD YAML to stdout
    Generate,

    /// Install every policy-resource CRD into the connected cluster
    Install,

    /// Apply a built-in Template bundle's Template and default Constraint
    InstallBundle {
        /// Bundle name, e.g. required-labels, no-latest-tag, unique-ingress-host
        name: String,
    },
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
pub enum ObservabilityAction {
    /// Print all observability manifests (Services + ServiceMonitors + Grafana dashboard)
    GenerateAll,

    /// Print only ServiceMonitor manifests
    GenerateServiceMonitors,

    /// Print only the Grafana dashboard ConfigMap
    GenerateDashboard,
}
