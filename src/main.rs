//! Action gateway server - main entry point.
//!
//! Serves a demo `echo` action over both transports:
//! - Message bus: `<service>.echo`
//! - RPC: every configured service, or `<service>.Echo/echo` when none is configured

use clap::Parser;
use serde_json::json;
use std::sync::Arc;

use action_gateway::action::{handler_fn, register, ActionDefinition};
use action_gateway::bus::{BusAdapter, MessageBus};
use action_gateway::codec::Document;
use action_gateway::dispatch::ActionExecutor;
use action_gateway::lock::{LocalLockProvider, LockProvider};
use action_gateway::rpc::{DescriptorSet, MethodDescriptor, RpcRouter, RpcServer, ServiceDescriptor};
use action_gateway::session::SessionType;
use action_gateway::Config;

/// Action gateway.
#[derive(Parser, Debug)]
#[command(name = "action-gateway")]
#[command(about = "Serve registered actions over the message bus and RPC")]
#[command(version)]
struct Cli {
    /// Path to a JSON configuration file.
    #[arg(short, long, value_name = "FILE", env = "GATEWAY_CONFIG")]
    config: Option<String>,

    /// Override the RPC listen address.
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,
}

fn echo_action() -> ActionDefinition {
    ActionDefinition::new(
        "echo",
        SessionType::None,
        handler_fn(|args| async move {
            Ok(Document::from(args.params.get("value").cloned().unwrap_or_default()))
        }),
    )
    .with_params_rules(json!({
        "type": "object",
        "properties": { "value": {} },
        "required": ["value"]
    }))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if let Some(listen) = cli.listen {
        config.rpc.listen_addr = listen;
    }

    action_gateway::observability::init_tracing_with(&config.observability);
    if let Some(addr) = &config.observability.metrics_addr {
        action_gateway::observability::init_metrics(addr.parse()?)?;
    }

    let lock_provider = Arc::new(LocalLockProvider::new(config.lock.acquire_timeout));
    let routes = Arc::new(register([echo_action()], Some(&*lock_provider as &dyn LockProvider))?);
    let executor = Arc::new(
        ActionExecutor::new(config.service_name.clone())
            .with_lock_provider(lock_provider)
            .with_lock_ttl(config.lock.ttl),
    );

    // Bus
    let bus = Arc::new(MessageBus::new(config.bus.clone()));
    let bus_adapter = BusAdapter::new(Arc::clone(&bus), Arc::clone(&executor), Arc::clone(&routes));
    bus_adapter.start().await?;

    // RPC
    let descriptors = match &config.rpc.descriptor_dir {
        Some(dir) => DescriptorSet::load_dir(dir)?,
        None => DescriptorSet::new(),
    };
    let (descriptors, services) = if config.rpc.services.is_empty() {
        let demo = format!("{}.Echo", config.service_name);
        let mut descriptors = descriptors;
        descriptors.insert(ServiceDescriptor::new(demo.clone(), vec![MethodDescriptor::new("echo")]));
        (descriptors, vec![demo])
    } else {
        (descriptors, config.rpc.services.clone())
    };
    let router = Arc::new(RpcRouter::build(&descriptors, &services, &routes)?);
    let server = Arc::new(RpcServer::new(router, Arc::clone(&executor), config.rpc.clone()));

    tracing::info!(
        service = %config.service_name,
        routes = routes.len(),
        rpc_enabled = config.rpc.enabled,
        "action gateway starting"
    );

    let serving = tokio::spawn({
        let server = Arc::clone(&server);
        async move { server.serve().await }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    server.shutdown();
    serving.await??;
    bus_adapter.stop().await?;

    Ok(())
}
