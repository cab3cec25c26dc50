use std::io;
use std::sync::Arc;

use server::authz::{AllowAll, Authorizer, BoardServiceAuthorizer};
use server::config::Config;
use server::gateway::spawn_gateway;
use server::server::run_server;
use server::snapshot_file::FileSnapshotStore;
use server::snapshot_store::SnapshotPersistence;

fn main() -> io::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::load().map_err(|error| {
        log::error!("Invalid configuration: {}", error);
        io::Error::new(io::ErrorKind::InvalidInput, error)
    })?;

    // rooms run on their own multi-threaded runtime, apart from the HTTP workers
    let rooms_runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.room_workers)
        .thread_name("boardsync-room")
        .enable_all()
        .build()?;

    let store: Arc<dyn SnapshotPersistence> = Arc::new(FileSnapshotStore::new(&config.snapshot_dir));
    let authorizer: Arc<dyn Authorizer> = match &config.board_service_url {
        Some(url) => Arc::new(
            BoardServiceAuthorizer::new(url.as_str(), config.authz_cache_ttl())
                .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?,
        ),
        None => {
            log::warn!("No board service configured, every join is allowed");
            Arc::new(AllowAll)
        }
    };

    let gateway_tx = {
        let _guard = rooms_runtime.enter();
        spawn_gateway(config.clone(), store, authorizer)
    };

    actix_web::rt::System::new().block_on(run_server(config, gateway_tx))
}
