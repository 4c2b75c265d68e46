// src/server.rs
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::info;

use crate::config::{self, ServerConfig};
use crate::error::{ServerError, ServerResult};
use crate::event_loop::{EventLoop, Listener};
use crate::router::Router;
use crate::syscalls;

pub struct Server {
    configs: Vec<ServerConfig>,
}

impl Server {
    pub fn from_config_file(path: &Path) -> ServerResult<Self> {
        Ok(Self {
            configs: config::load(path)?,
        })
    }

    pub fn from_configs(configs: Vec<ServerConfig>) -> Self {
        Self { configs }
    }

    /// Bind every configured port, install signal handling and run the
    /// event loop until shutdown is requested.
    pub fn run(self) -> ServerResult<()> {
        // A half-closed peer must surface as a write error, not kill us.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_IGN);
        }

        let running = Arc::new(AtomicBool::new(true));
        let shutdown_flag = running.clone();
        ctrlc::set_handler(move || {
            info!("shutdown signal received, draining");
            shutdown_flag.store(false, Ordering::Release);
        })
        .map_err(|e| ServerError::Signal(e.to_string()))?;

        let mut listeners: Vec<Listener> = Vec::with_capacity(self.configs.len());
        for config in &self.configs {
            match syscalls::create_listen_socket(config.port) {
                Ok(fd) => {
                    info!(
                        port = config.port,
                        server_name = %config.server_name,
                        root = %config.root,
                        "listening"
                    );
                    listeners.push(Listener {
                        fd,
                        port: config.port,
                    });
                }
                Err(e) => {
                    for listener in &listeners {
                        syscalls::close_fd(listener.fd);
                    }
                    return Err(e);
                }
            }
        }

        let mut event_loop = EventLoop::new(listeners, Router::new(self.configs), running)?;
        event_loop.run()?;
        info!("server shutdown complete");
        Ok(())
    }
}
