//! tabpilot - 网页智能体演示入口
//!
//! 在内置的模拟页面上运行一次会话：`tabpilot "<goal>"`，按 Ctrl-C 停止。

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tabpilot::actuator::{SimElement, SimPage, SimulatedSurface};
use tabpilot::config::{load_config, AppConfig};
use tabpilot::{observability, OrchestratorBuilder};

/// 演示用的小型商店
fn demo_surface() -> SimulatedSurface {
    SimulatedSurface::new("https://shop.example")
        .with_page(
            "https://shop.example",
            SimPage::new("Example Shop")
                .element(SimElement::new("searchbox", "Search products", 400, 80))
                .element(
                    SimElement::new("link", "Deals", 120, 80).link_to("https://shop.example/deals"),
                )
                .element(SimElement::new("dialog", "Accept cookies", 400, 300))
                .element(SimElement::new("link", "Footer: About us", 400, 1400).below_fold(300))
                .submits_to("https://shop.example/search"),
        )
        .with_page(
            "https://shop.example/search",
            SimPage::new("Search results")
                .element(
                    SimElement::new("link", "Laptop 14\" - $899", 300, 200)
                        .link_to("https://shop.example/item/1"),
                )
                .data("price", "$899"),
        )
        .with_page(
            "https://shop.example/deals",
            SimPage::new("Deals").element(SimElement::new("text", "No deals today", 300, 200)),
        )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let goal = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    let goal = if goal.trim().is_empty() {
        "find the price of a laptop".to_string()
    } else {
        goal
    };

    let config_path = std::env::var("TABPILOT_CONFIG").ok().map(PathBuf::from);
    let cfg = load_config(config_path.clone()).unwrap_or_else(|e| {
        tracing::warn!("Config load failed ({}), using defaults", e);
        AppConfig::default()
    });

    let orchestrator = OrchestratorBuilder::new(cfg)
        .surface(Arc::new(demo_surface()))
        .config_path(config_path)
        .build()
        .context("Failed to build orchestrator")?;

    let mut notifications = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(n) = notifications.recv().await {
            println!("{}", n.text());
        }
    });

    let session_id = orchestrator
        .start_session(&goal)
        .await
        .context("Failed to start session")?;
    tracing::info!(%session_id, "running demo session");

    let outcome = tokio::select! {
        outcome = orchestrator.wait() => outcome,
        _ = tokio::signal::ctrl_c() => orchestrator.stop_session().await,
    };

    match outcome {
        Some(o) => println!("{} after {} actions: {}", o.status, o.actions, o.message),
        None => println!("session ended without an outcome"),
    }
    Ok(())
}
