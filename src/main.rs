use std::sync::Arc;
use std::time::Duration;

use gigflow::approval::ApprovalRouter;
use gigflow::config::{ModeController, PipelineConfig, SubmissionMode};
use gigflow::offline::{
    DryRunSubmitter, LogGateway, NoopExtractor, PassThroughScorer, SpendFloorBooster,
    TemplateGenerator,
};
use gigflow::pipeline::{Ingestor, JobLocks, ManualUrlConnector, Orchestrator};
use gigflow::registry::{ActiveTaskRegistry, TaskCategory};
use gigflow::scheduler;
use gigflow::server::control_routes;
use gigflow::stage::StageSet;
use gigflow::store::{Database, LibSqlBackend};
use gigflow::submit::SubmissionAgent;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = PipelineConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: invalid configuration: {e}");
        std::process::exit(1);
    });

    let mode: SubmissionMode = std::env::var("GIGFLOW_MODE")
        .unwrap_or_else(|_| "manual".to_string())
        .parse()
        .unwrap_or_else(|e| {
            eprintln!("Error: {e}");
            std::process::exit(1);
        });

    let port: u16 = std::env::var("GIGFLOW_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    eprintln!("gigflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Mode: {mode}");
    eprintln!("   API: http://0.0.0.0:{port}/api");
    eprintln!("   Task WS: ws://0.0.0.0:{port}/ws/tasks");

    // ── Database ─────────────────────────────────────────────────────
    let db_path =
        std::env::var("GIGFLOW_DB_PATH").unwrap_or_else(|_| "./data/gigflow.db".to_string());

    let store: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .unwrap_or_else(|e| {
                eprintln!("Error: failed to open database at {db_path}: {e}");
                std::process::exit(1);
            }),
    );
    eprintln!("   Database: {db_path}");

    // ── Shared infrastructure ────────────────────────────────────────
    let locks = JobLocks::new();
    let mode_controller = Arc::new(ModeController::new(mode));
    let gen_registry =
        ActiveTaskRegistry::new(TaskCategory::AssetGeneration, config.task_retention);
    let submit_registry =
        ActiveTaskRegistry::new(TaskCategory::Submission, config.task_retention);

    // ── Providers ────────────────────────────────────────────────────
    // Offline stand-ins until real integrations are wired in; the
    // control-plane contract is identical either way.
    let stages = StageSet {
        scorer: Arc::new(PassThroughScorer),
        extractor: Arc::new(NoopExtractor),
        generator: Arc::new(TemplateGenerator),
        booster: Arc::new(SpendFloorBooster),
    };

    let agent = SubmissionAgent::new(
        Arc::clone(&store),
        submit_registry,
        Arc::new(DryRunSubmitter),
        Arc::clone(&locks),
        config.submit_timeout,
    );

    let decisions = Arc::new(ApprovalRouter::new(
        Arc::clone(&store),
        Arc::clone(&locks),
        Arc::clone(&mode_controller),
        Arc::clone(&agent),
    ));

    let mut ingestor = Ingestor::new(Arc::clone(&store));
    ingestor.register(Arc::new(ManualUrlConnector));

    let orchestrator = Orchestrator::new(
        Arc::clone(&store),
        stages,
        Arc::new(LogGateway),
        agent,
        gen_registry,
        mode_controller,
        locks,
        ingestor,
        config.clone(),
    );

    // ── Scheduler ────────────────────────────────────────────────────
    if let Some(ref schedule) = config.auto_run_schedule {
        let _ticker =
            scheduler::spawn_auto_process_ticker(Arc::clone(&orchestrator), schedule.clone())?;
        eprintln!("   Auto-run: {schedule}");
    } else {
        eprintln!("   Auto-run: disabled");
    }

    // ── Server ───────────────────────────────────────────────────────
    let app = control_routes(orchestrator, decisions);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "Control-plane server started");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
            // Let in-flight commits land before the process exits.
            tokio::time::sleep(Duration::from_millis(100)).await;
        })
        .await?;

    Ok(())
}
