mod cli;
mod controllers;
mod error;
mod keyvault;
mod metrics;

use std::{sync::Arc, time::Duration};

use actix_web::{get, middleware, web, App, HttpRequest, HttpResponse, HttpServer, Responder};
use clap::Parser as _;
use cli::{Cli, Commands, ControllerArgs};
use kube::{Client, CustomResourceExt as _};
use kube_lease_manager::LeaseManagerBuilder;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt as _, util::SubscriberInitExt as _};

pub use crate::error::{ControllerError as Error, Result};
use crate::{
    controllers::{
        defaultcert::{self, CertStore, DefaultDomainCertificate},
        externaldns::{self, ClusterExternalDNS, ExternalDNS},
        nginx::{self, NginxIngressController},
        resources, spc,
        watchdog::{Watchdog, WatchdogConfig},
        OPERATOR_NAME,
    },
    keyvault::{CertificateClient, CertificateClientConfig},
    metrics::Metrics,
};

struct ProbeState {
    metrics: Metrics,
    cert_client: Option<Arc<CertificateClient>>,
    client: Client,
}

#[get("/healthz")]
async fn healthz(_: HttpRequest) -> impl Responder {
    HttpResponse::Ok().json("healthy")
}

#[get("/readyz")]
async fn readyz(state: web::Data<ProbeState>) -> impl Responder {
    if let Some(cert_client) = &state.cert_client {
        if !cert_client.is_healthy() {
            return HttpResponse::ServiceUnavailable().json("certificate client unhealthy");
        }
    }
    match state.client.apiserver_version().await {
        Ok(_) => HttpResponse::Ok().json("ready"),
        Err(_) => HttpResponse::ServiceUnavailable().json("apiserver unreachable"),
    }
}

#[get("/metrics")]
async fn metrics_endpoint(state: web::Data<ProbeState>) -> impl Responder {
    let mut buffer = String::new();
    match prometheus_client::encoding::text::encode(&mut buffer, &state.metrics.registry) {
        Ok(()) => HttpResponse::Ok()
            .content_type("application/openmetrics-text; version=1.0.0; charset=utf-8")
            .body(buffer),
        Err(_) => HttpResponse::InternalServerError().finish(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match args.commands() {
        Commands::CreateYaml => print_crds()?,
        Commands::Run(args) => run(args.clone()).await?,
    }

    Ok(())
}

fn print_crds() -> Result<()> {
    let crds = [
        serde_yaml::to_string(&NginxIngressController::crd())?,
        serde_yaml::to_string(&ExternalDNS::crd())?,
        serde_yaml::to_string(&ClusterExternalDNS::crd())?,
        serde_yaml::to_string(&DefaultDomainCertificate::crd())?,
    ];
    print!("{}", crds.join("---\n"));
    Ok(())
}

async fn run(args: ControllerArgs) -> Result<()> {
    let client = Client::try_default().await?;
    let metrics = Metrics::default();
    let cert_client = args.default_domain_cert_url().map(|url| {
        Arc::new(CertificateClient::new(
            url.clone(),
            CertificateClientConfig::default(),
            metrics.keyvault.clone(),
        ))
    });
    let store = Arc::new(CertStore::new(args.cert_dir()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(signal_watcher(shutdown_tx));

    let server = run_server(&args, metrics.clone(), cert_client.clone(), client.clone())?;

    // The probe server answers while leadership is still being contested;
    // whichever side finishes first takes the process down with it.
    tokio::select! {
        result = server => result?,
        result = run_leader_tasks(client, args, metrics, cert_client, store, shutdown_rx) => result?,
    }
    Ok(())
}

async fn signal_watcher(tx: watch::Sender<bool>) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => warn!("installing SIGTERM handler failed: {e}"),
        }
    };
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    let _ = tx.send(true);
}

fn run_server(
    args: &ControllerArgs,
    metrics: Metrics,
    cert_client: Option<Arc<CertificateClient>>,
    client: Client,
) -> Result<actix_web::dev::Server> {
    let state = web::Data::new(ProbeState {
        metrics,
        cert_client,
        client,
    });
    let server = HttpServer::new(move || {
        App::new()
            .wrap(
                middleware::Logger::default()
                    .exclude("/healthz")
                    .exclude("/readyz")
                    .exclude("/metrics"),
            )
            .app_data(state.clone())
            .service(healthz)
            .service(readyz)
            .service(metrics_endpoint)
    })
    .bind(args.probe_addr())?
    .workers(2)
    .shutdown_timeout(5);

    Ok(server.run())
}

/// Everything with side effects runs behind the lease: the event-driven
/// controllers as much as the timer loops, so two replicas never race on
/// writes.
async fn run_leader_tasks(
    client: Client,
    args: ControllerArgs,
    metrics: Metrics,
    cert_client: Option<Arc<CertificateClient>>,
    store: Arc<CertStore>,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<()> {
    let identity = std::env::var("HOSTNAME").unwrap_or_else(|_| OPERATOR_NAME.to_string());
    let manager = LeaseManagerBuilder::new(client.clone(), args.lease_name())
        .with_namespace(args.operator_namespace())
        .with_identity(&identity)
        .build()
        .await?;
    let (mut leader_rx, lease_handle) = manager.watch().await;

    info!("waiting to acquire leadership as \"{identity}\"");
    while !*leader_rx.borrow_and_update() {
        if leader_rx.changed().await.is_err() {
            warn!("lease manager stopped before leadership was acquired");
            return Ok(());
        }
    }
    info!("leadership acquired, starting controllers");

    let (rotation_tx, rotation_rx) = watch::channel(String::new());
    let rotation_poller = defaultcert::watch_rotation(
        store.clone(),
        rotation_tx,
        Duration::from_secs(30),
        shutdown_rx.clone(),
    );
    let refresher = {
        let store = store.clone();
        let shutdown = shutdown_rx.clone();
        async move {
            if let Some(cert_client) = cert_client {
                keyvault::run_refresher(cert_client, Some(store), shutdown).await;
            }
        }
    };
    let watchdog = Watchdog::new(
        client.clone(),
        watchdog_config(&args),
        args.operator_namespace().to_string(),
    );

    let tasks = async {
        let (spc, edns, nic, cert, enforcer, _, _, _) = tokio::join!(
            spc::run_controllers(client.clone(), args.clone(), metrics.clone()),
            externaldns::run_controllers(client.clone(), args.clone(), metrics.clone()),
            nginx::run_controller(client.clone(), args.clone(), metrics.clone()),
            defaultcert::run_controller(client.clone(), store.clone(), rotation_rx, metrics.clone()),
            resources::run(client.clone(), args.clone(), metrics.clone(), shutdown_rx.clone()),
            watchdog.run(shutdown_rx.clone()),
            rotation_poller,
            refresher,
        );
        for result in [spc, edns, nic, cert, enforcer] {
            if let Err(e) = result {
                warn!("controller task failed: {e}");
            }
        }
    };

    tokio::select! {
        _ = tasks => {}
        _ = leadership_lost(leader_rx) => warn!("leadership lost, shutting down"),
    }
    drop(lease_handle);
    Ok(())
}

async fn leadership_lost(mut leader_rx: watch::Receiver<bool>) {
    loop {
        if leader_rx.changed().await.is_err() {
            return;
        }
        if !*leader_rx.borrow() {
            return;
        }
    }
}

fn watchdog_config(args: &ControllerArgs) -> WatchdogConfig {
    WatchdogConfig {
        tick: Duration::from_secs(args.watchdog_interval_seconds()),
        min_pod_age: Duration::from_secs(args.watchdog_min_pod_age_seconds()),
        vote_ttl: Duration::from_secs(args.watchdog_vote_ttl_seconds()),
        min_votes_before_eviction: args.watchdog_min_votes(),
        min_percent_over_avg: args.watchdog_percent_over_avg(),
        ..Default::default()
    }
}
