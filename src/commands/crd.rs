use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{Api, Client, CustomResourceExt};

use polygov::bundles;
use polygov::crd::{Constraint, ConstraintSpec, ConstraintTemplate, ExpansionRule, Mutator, Provider, SyncConfig};

/// Print every policy-resource CRD's YAML to stdout for `kubectl apply -f`.
pub fn generate() -> Result<()> {
    for crd in all_crds() {
        println!("{}", serde_yaml::to_string(&crd)?);
        println!("---");
    }
    Ok(())
}

fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        ConstraintTemplate::crd(),
        Constraint::crd(),
        Mutator::crd(),
        ExpansionRule::crd(),
        SyncConfig::crd(),
        Provider::crd(),
    ]
}

/// Apply every policy-resource CRD directly to the connected cluster.
pub async fn install() -> Result<()> {
    let client = Client::try_default().await?;
    let crds: Api<CustomResourceDefinition> = Api::all(client);

    for crd in all_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        match crds.create(&Default::default(), &crd).await {
            Ok(_) => println!("CRD '{name}' installed successfully"),
            Err(kube::Error::Api(err)) if err.code == 409 => {
                println!("CRD '{name}' already exists — skipping");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Applies a built-in Template bundle's Template and default Constraint to
/// the connected cluster (requires the ConstraintTemplate/Constraint CRDs to
/// already be installed).
pub async fn install_bundle(name: &str) -> Result<()> {
    use kube::api::PostParams;

    let bundle = bundles::get_bundle(name).with_context(|| format!("unknown bundle '{name}'"))?;

    let client = Client::try_default().await?;
    let templates: Api<ConstraintTemplate> = Api::namespaced(client.clone(), "default");
    let constraints: Api<Constraint> = Api::namespaced(client, "default");

    let source: polygov::driver::rule::RuleSource = serde_json::from_str(&bundle.source)?;
    let template = ConstraintTemplate::new(
        &bundle.name,
        polygov::crd::ConstraintTemplateSpec {
            crd_kind: bundle.crd_kind.clone(),
            parameter_schema: serde_json::json!({}),
            targets: vec![
                polygov::crd::TemplateTarget {
                    target: "admission".to_string(),
                    driver: bundle.driver,
                    source: serde_json::to_string(&source)?,
                },
                polygov::crd::TemplateTarget {
                    target: "audit".to_string(),
                    driver: bundle.driver,
                    source: serde_json::to_string(&source)?,
                },
            ],
        },
    );

    match templates.create(&PostParams::default(), &template).await {
        Ok(_) => println!("Template '{}' installed", bundle.name),
        Err(kube::Error::Api(err)) if err.code == 409 => println!("Template '{}' already exists", bundle.name),
        Err(e) => return Err(e.into()),
    }

    let constraint_name = format!("{}-default", bundle.name);
    let constraint = Constraint::new(
        &constraint_name,
        ConstraintSpec {
            kind: bundle.crd_kind.clone(),
            r#match: bundles::default_match(),
            enforcement_action: bundle.default_enforcement_action.clone(),
            parameters: serde_json::json!({}),
        },
    );

    match constraints.create(&PostParams::default(), &constraint).await {
        Ok(_) => println!("Constraint '{constraint_name}' installed"),
        Err(kube::Error::Api(err)) if err.code == 409 => println!("Constraint '{constraint_name}' already exists"),
        Err(e) => return Err(e.into()),
    }

    Ok(())
}
