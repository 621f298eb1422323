//! Rangemaster cluster master daemon executable.

use std::net::{Ipv4Addr, SocketAddr};
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use log::{self, LevelFilter};
use rangemaster::api::{AdminClient, AdminRequest};
use rangemaster::coord::{CoordStore, MemCoord, ZkCoord};
use rangemaster::dfs::LocalDfs;
use rangemaster::master::{Master, MasterConfig};
use rangemaster::{logger_init, pf_error, pf_warn, RangemasterError};
use tokio::runtime::Builder;
use tokio::sync::watch;
use tokio::time::Duration;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// What to do: 'start' a master, or 'stop' (drain) the cluster.
    #[arg(value_parser = ["start", "stop"])]
    command: String,

    /// Local IP to use for binding the listening sockets.
    #[arg(short, long, default_value_t = Ipv4Addr::UNSPECIFIED)]
    bind_ip: Ipv4Addr,

    /// Region-server-facing port.
    #[arg(short, long, default_value_t = 52800)]
    rs_port: u16,

    /// Admin-facing port.
    #[arg(short, long, default_value_t = 52801)]
    admin_port: u16,

    /// ZooKeeper server address; omit to run the single-process in-memory
    /// coordination store (no standby masters possible).
    #[arg(short, long)]
    zookeeper: Option<SocketAddr>,

    /// Start as a backup master: stall before contending for the lock.
    #[arg(long, default_value_t = false)]
    backup: bool,

    /// Minimum region servers needed to host user tables.
    #[arg(long)]
    min_servers: Option<u32>,

    /// Configuration overrides, e.g. '-D rootdir=/data/rm'.
    #[arg(short = 'D', long = "define")]
    overrides: Vec<String>,

    /// For 'stop': the active master's admin address.
    #[arg(short, long)]
    master_addr: Option<SocketAddr>,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments and compose the master config,
    /// returning `Ok(config)` on success or `Err(RangemasterError)` on any
    /// error.
    fn sanitize(&self) -> Result<MasterConfig, RangemasterError> {
        if self.rs_port <= 1024 {
            return Err(RangemasterError::msg(format!(
                "invalid rs_port {}",
                self.rs_port
            )));
        } else if self.admin_port <= 1024 {
            return Err(RangemasterError::msg(format!(
                "invalid admin_port {}",
                self.admin_port
            )));
        } else if self.rs_port == self.admin_port {
            return Err(RangemasterError::msg(format!(
                "rs_port == admin_port {}",
                self.rs_port
            )));
        } else if self.threads < 2 {
            return Err(RangemasterError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        // '-D key=value' pairs compose a TOML overrides string; values
        // that don't parse as TOML scalars are treated as strings
        let mut config_str = String::new();
        for pair in &self.overrides {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                RangemasterError::msg(format!(
                    "override '{}' is not key=value",
                    pair
                ))
            })?;
            if value.parse::<i64>().is_ok()
                || value == "true"
                || value == "false"
            {
                config_str.push_str(&format!("{} = {}\n", key, value));
            } else {
                config_str.push_str(&format!("{} = '{}'\n", key, value));
            }
        }

        let mut config = MasterConfig::from_config_str(if config_str
            .is_empty()
        {
            None
        } else {
            Some(&config_str)
        })?;
        config.backup = config.backup || self.backup;
        if let Some(min_servers) = self.min_servers {
            config.min_servers = min_servers;
        }
        Ok(config)
    }
}

/// Actual main function of the master daemon.
fn master_main() -> Result<(), RangemasterError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    let config = args.sanitize()?;

    // set up termination signals handler
    let (tx_term, rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            eprintln!("error sending to term channel: {}", e);
        }
    })
    .map_err(RangemasterError::msg)?;

    let rs_addr: SocketAddr =
        format!("{}:{}", args.bind_ip, args.rs_port).parse()?;
    let admin_addr: SocketAddr =
        format!("{}:{}", args.bind_ip, args.admin_port).parse()?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-master")
            .build()?;

        // enter tokio runtime, set up the master, and run the main loop
        runtime.block_on(async move {
            if args.command == "stop" {
                let master_addr = args.master_addr.unwrap_or(admin_addr);
                let mut admin = AdminClient::connect(master_addr).await?;
                admin.request(&AdminRequest::Shutdown).await?;
                admin.leave().await?;
                println!("cluster shutdown started via {}", master_addr);
                return Ok(());
            }

            let store: Arc<dyn CoordStore> = match args.zookeeper {
                Some(zk_addr) => Arc::new(
                    ZkCoord::connect(
                        zk_addr,
                        Duration::from_millis(config.session_timeout_ms),
                    )
                    .await?,
                ),
                None => {
                    pf_warn!("master"; "no ZooKeeper given; running the \
                                        in-process coordination store");
                    Arc::new(MemCoord::new().session())
                }
            };

            let mut master = Master::new_and_setup(
                config,
                store,
                Arc::new(LocalDfs::default()),
                rs_addr,
                admin_addr,
            )
            .await?;

            master.run(rx_term).await?;

            // suppress logging before dropping the runtime to avoid
            // spurious error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), RangemasterError>(())
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of the master daemon.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = master_main() {
        pf_error!("master"; "master_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn base_args() -> CliArgs {
        CliArgs {
            command: "start".into(),
            bind_ip: Ipv4Addr::UNSPECIFIED,
            rs_port: 52800,
            admin_port: 52801,
            zookeeper: None,
            backup: false,
            min_servers: None,
            overrides: vec![],
            master_addr: None,
            threads: 8,
        }
    }

    #[test]
    fn sanitize_valid() -> Result<(), RangemasterError> {
        let mut args = base_args();
        args.backup = true;
        args.min_servers = Some(3);
        args.overrides = vec!["rootdir=/data/rm".into()];
        let config = args.sanitize()?;
        assert!(config.backup);
        assert_eq!(config.min_servers, 3);
        assert_eq!(config.rootdir, "/data/rm");
        Ok(())
    }

    #[test]
    fn sanitize_invalid_ports() {
        let mut args = base_args();
        args.rs_port = 1023;
        assert!(args.sanitize().is_err());

        let mut args = base_args();
        args.admin_port = args.rs_port;
        assert!(args.sanitize().is_err());
    }

    #[test]
    fn sanitize_invalid_override() {
        let mut args = base_args();
        args.overrides = vec!["not-a-pair".into()];
        assert!(args.sanitize().is_err());

        let mut args = base_args();
        args.overrides = vec!["no_such_field=1".into()];
        assert!(args.sanitize().is_err());
    }
}
