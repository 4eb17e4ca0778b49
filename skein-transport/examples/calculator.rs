//! Calculator example: a `calc@1.0` host and a client calling it.
//!
//! Without arguments both roles run in one process. They can also run in
//! two terminals:
//!
//! ```bash
//! # Terminal 1 - Start the server
//! cargo run --example calculator -- server
//!
//! # Terminal 2 - Run the client
//! cargo run --example calculator -- client
//! ```
//!
//! Set `RUST_LOG=debug` to watch envelopes move through the bus.

use std::env;
use std::rc::Rc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use skein_transport::{
    Bus, EndpointMap, Providers, RequestContext, RpcError, ServiceClient, ServiceFault,
    ServiceHost, ServiceIdentity, StaticRegistry, TcpBus, TimeProvider, TokioProviders,
    TransportConfig, TransportKind,
};

// ============================================================================
// Configuration
// ============================================================================

const SERVER_ADDR: &str = "127.0.0.1:4600";
const CALC: &str = "calc@1.0";

// ============================================================================
// Message Types
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct Operands {
    a: i64,
    b: i64,
}

impl Operands {
    fn into_args(self) -> Map<String, Value> {
        match serde_json::to_value(self) {
            Ok(Value::Object(args)) => args,
            _ => Map::new(),
        }
    }

    fn from_args(args: Map<String, Value>) -> Result<Self, ServiceFault> {
        serde_json::from_value(Value::Object(args))
            .map_err(|e| ServiceFault::business(format!("invalid operands: {e}")))
    }
}

fn calculator() -> EndpointMap {
    let mut endpoints = EndpointMap::new();
    endpoints
        .insert("add", |_context, args| async move {
            let Operands { a, b } = Operands::from_args(args)?;
            tracing::info!(a, b, "ADD");
            Ok(json!(a + b))
        })
        .insert("mul", |_context, args| async move {
            let Operands { a, b } = Operands::from_args(args)?;
            tracing::info!(a, b, "MUL");
            Ok(json!(a * b))
        })
        .insert("div", |_context, args| async move {
            let Operands { a, b } = Operands::from_args(args)?;
            tracing::info!(a, b, "DIV");
            if b == 0 {
                return Err(ServiceFault::business("division_by_zero"));
            }
            Ok(json!(a / b))
        })
        .insert_deprecated("divide", Some("div"), |_context, args| async move {
            let Operands { a, b } = Operands::from_args(args)?;
            a.checked_div(b)
                .map(|quotient| json!(quotient))
                .ok_or_else(|| ServiceFault::business("division_by_zero"))
        });
    endpoints
}

// ============================================================================
// Server
// ============================================================================

async fn start_server(
    providers: TokioProviders,
    registry: StaticRegistry,
) -> Result<(TcpBus<TokioProviders>, ServiceHost<TokioProviders>), Box<dyn std::error::Error>> {
    let config = TransportConfig::from_json_file("skein.json")?;
    let bus = TcpBus::new(providers.clone(), Rc::new(registry.clone()), config);
    let address = bus.listen(SERVER_ADDR).await?;

    let host = ServiceHost::new(
        ServiceIdentity::parse(CALC)?,
        calculator(),
        providers,
        Rc::new(registry),
    );
    host.attach_bus(Rc::new(bus.clone()))?;
    host.register()?;
    host.serve()?;

    tracing::info!(address = %address, entity = CALC, "calculator serving");
    Ok((bus, host))
}

// ============================================================================
// Client
// ============================================================================

async fn run_client(
    providers: TokioProviders,
    registry: StaticRegistry,
) -> Result<(), Box<dyn std::error::Error>> {
    let time = providers.time().clone();
    let config = TransportConfig::from_json_file("skein.json")?;
    let bus: Rc<dyn Bus> = Rc::new(TcpBus::new(
        providers.clone(),
        Rc::new(registry),
        config.clone(),
    ));
    let calc = ServiceClient::new(
        ServiceIdentity::parse(CALC)?,
        TransportKind::Tcp,
        providers,
        config.rpc,
    );
    calc.attach_bus(&bus);

    let tests = [
        ("10 + 5", "add", Operands { a: 10, b: 5 }),
        ("6 * 8", "mul", Operands { a: 6, b: 8 }),
        ("100 / 4", "div", Operands { a: 100, b: 4 }),
        ("42 / 0", "div", Operands { a: 42, b: 0 }),
        ("9 / 3 (old name)", "divide", Operands { a: 9, b: 3 }),
    ];

    let mut success_count = 0;
    for (desc, endpoint, operands) in tests {
        println!("Sending: {desc}");
        let context = RequestContext::new().with_timeout(Duration::from_secs(5));
        match calc.send(endpoint, operands.into_args(), &context).await {
            Ok(reply) => {
                println!("  Result: {}", reply.result);
                if let Some(deprecation) = reply.deprecation {
                    println!(
                        "  Note: {} is deprecated, use {}",
                        deprecation.old_api,
                        deprecation.replacement_api.as_deref().unwrap_or("-")
                    );
                }
                success_count += 1;
            }
            Err(RpcError::RemoteStructured { error, .. }) => {
                println!("  Refused: {error}");
                success_count += 1;
            }
            Err(e) => println!("  ERROR: {e}"),
        }
        let _ = time.sleep(Duration::from_millis(100)).await;
    }

    println!(
        "\n{}/{} operations completed",
        success_count,
        tests.len()
    );
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

async fn run(mode: &str) -> Result<(), Box<dyn std::error::Error>> {
    let providers = TokioProviders::new();
    let registry = StaticRegistry::new();
    registry.add_route(CALC, SERVER_ADDR);

    match mode {
        "server" => {
            let _server = start_server(providers, registry).await?;
            std::future::pending::<()>().await;
            Ok(())
        }
        "client" => run_client(providers, registry).await,
        _ => {
            let (bus, _host) = start_server(providers.clone(), registry.clone()).await?;
            run_client(providers, registry).await?;
            bus.close().await;
            Ok(())
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mode = env::args().nth(1).unwrap_or_default();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    tokio::task::LocalSet::new().block_on(&runtime, run(&mode))
}
