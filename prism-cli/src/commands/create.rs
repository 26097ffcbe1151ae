use anyhow::{Context, Result};
use prism_provision::{CreateCollectionRequest, LocalCluster, NodeProperties, ProvisionConfig};
use std::collections::HashMap;
use std::path::Path;

/// Options for a simulated collection creation
pub struct CreateOptions<'a> {
    pub params: &'a [String],
    pub nodes: usize,
    pub zones: usize,
    pub config_sets: &'a [String],
    pub config_file: Option<&'a Path>,
    pub rpc: bool,
}

/// Split `key=value` pairs into a parameter map
pub fn parse_params(pairs: &[String]) -> Result<HashMap<String, String>> {
    pairs
        .iter()
        .map(|pair| {
            let (key, value) = pair
                .split_once('=')
                .with_context(|| format!("parameter '{}' is not key=value", pair))?;
            Ok((key.trim().to_string(), value.to_string()))
        })
        .collect()
}

/// Create a collection on a fresh single-process cluster and print the result as JSON
pub async fn run_create(options: CreateOptions<'_>) -> Result<()> {
    let config = match options.config_file {
        Some(path) => ProvisionConfig::load(path)?,
        None => ProvisionConfig::default(),
    };
    let request = CreateCollectionRequest::from_params(&parse_params(options.params)?)?;

    let cluster = if options.rpc {
        LocalCluster::start_with_rpc(config)
    } else {
        LocalCluster::start(config)
    };
    for i in 0..options.nodes {
        let node = format!("node{}:8983_prism", i + 1);
        let properties = if options.zones > 0 {
            NodeProperties::with_zone(format!("zone-{}", i % options.zones + 1))
        } else {
            NodeProperties::default()
        };
        cluster.add_node(&node, properties).await?;
    }
    for name in options.config_sets {
        cluster.upload_config(name).await?;
    }

    let result = cluster.create_collection(&request).await;
    let output = match &result {
        Ok(response) => {
            let state = cluster.context().reader.refresh().await?;
            serde_json::json!({
                "success": response.success,
                "warnings": response.warnings,
                "async": response.async_id,
                "collection": state.collections().find(|c| c.name == request.name),
            })
        }
        Err(e) => serde_json::json!({
            "error": e.to_string(),
            "kind": e.kind(),
        }),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);

    cluster.shutdown().await;
    result?;
    Ok(())
}
