mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands, CrdAction, ObservabilityAction, WebhookAction};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Check => commands::check::run().await?,
        Commands::List { resource } => commands::list::run(resource).await?,
        Commands::Watch => commands::watch::run().await?,
        Commands::Reconcile => commands::reconcile::run().await?,

        Commands::Crd { action } => match action {
            CrdAction::Generate => commands::crd::generate()?,
            CrdAction::Install => commands::crd::install().await?,
            CrdAction::InstallBundle { name } => commands::crd::install_bundle(&name).await?,
        },

        Commands::Webhook { action } => match action {
            WebhookAction::Serve { addr, tls_cert, tls_key } => {
                commands::webhook::serve(&addr, &tls_cert, &tls_key).await?
            }
            WebhookAction::CertGenerate { service_name, namespace, output_dir, ip_sans } => {
                commands::webhook::generate_certs(&service_name, &namespace, &output_dir, &ip_sans)?
            }
            WebhookAction::InstallConfig { service_name, namespace, ca_bundle_path } => {
                commands::webhook::install_config(&service_name, &namespace, &ca_bundle_path)?
            }
        },

        Commands::Observability { action } => match action {
            ObservabilityAction::GenerateAll => commands::observability::generate_all()?,
            ObservabilityAction::GenerateServiceMonitors => commands::observability::generate_service_monitors()?,
            ObservabilityAction::GenerateDashboard => {
                println!("{}", commands::observability::generate_grafana_dashboard_configmap()?);
            }
        },
    }

    Ok(())
}
