use std::sync::Arc;

use structopt::StructOpt;

use vhost_user_fs::config::{FsConfig, Opt};
use vhost_user_fs::error::default_panic_handler;
use vhost_user_fs::fuse_session::{FuseSession, NullFuseSession};
use vhost_user_fs::session::SessionController;
use vhost_user_fs::thread_pool::ThreadPool;

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let opt = Opt::from_args();
    let config = FsConfig::from_opt(opt)?;

    let panic_handler = default_panic_handler();

    log::info!(
        "starting vhost-user-fs: tag={} socket={}",
        config.tag,
        config.socket_path.display()
    );

    // `NullFuseSession` stands in for the real passthrough filesystem,
    // which is out of scope for this transport (`spec.md` §1).
    let session: Arc<dyn FuseSession> = Arc::new(NullFuseSession::new()?);
    let pool = Arc::new(ThreadPool::new(config.thread_pool_size));

    let controller = SessionController::realize(&config.socket_path)?;
    if let Err(e) = controller.run(config, session, pool) {
        panic_handler(&format!("transport terminated: {}", e));
    }

    Ok(())
}
