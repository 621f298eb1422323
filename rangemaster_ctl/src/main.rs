//! Rangemaster admin command-line tool.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rangemaster::api::{AdminClient, AdminReply, AdminRequest, TableAction};
use rangemaster::catalog::{key_display, FamilySchema, TableSchema};
use rangemaster::{logger_init, pf_error, RangemasterError};
use tokio::runtime::Builder;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// The active master's admin address.
    #[arg(short, long, default_value = "127.0.0.1:52801")]
    master: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print cluster status.
    Status,

    /// Create a table, optionally pre-split at the given keys.
    CreateTable {
        table: String,
        /// Split keys (UTF-8), e.g. '-s g -s p' for three regions.
        #[arg(short, long)]
        split: Vec<String>,
    },

    /// Delete a table and all its regions.
    DeleteTable { table: String },

    /// Re-enable a disabled table.
    EnableTable { table: String },

    /// Take a table's regions offline.
    DisableTable { table: String },

    /// List a table's regions and their servers.
    Regions { table: String },

    /// Split the region of a table containing the given key, exactly
    /// there.
    Split { table: String, split_point: String },

    /// Move a region to a specific host.
    MoveRegion {
        table: String,
        region_name: String,
        host: String,
    },

    /// Add a column family to a table.
    AddColumn { table: String, family: String },

    /// Drop a column family from a table.
    DeleteColumn { table: String, family: String },

    /// Progress of an ongoing alter.
    AlterStatus { table: String },

    /// Start cluster-wide drain and shutdown.
    Shutdown,

    /// Stop the active master only (a standby takes over).
    StopMaster,
}

impl Command {
    fn into_request(self) -> AdminRequest {
        match self {
            Command::Status => AdminRequest::GetClusterStatus,
            Command::CreateTable { table, split } => {
                AdminRequest::CreateTable {
                    schema: TableSchema::new(table),
                    split_keys: split
                        .into_iter()
                        .map(|s| s.into_bytes())
                        .collect(),
                }
            }
            Command::DeleteTable { table } => {
                AdminRequest::DeleteTable { table }
            }
            Command::EnableTable { table } => {
                AdminRequest::EnableTable { table }
            }
            Command::DisableTable { table } => {
                AdminRequest::DisableTable { table }
            }
            Command::Regions { table } => {
                AdminRequest::GetTableRegions { table }
            }
            Command::Split { table, split_point } => {
                AdminRequest::ModifyTable {
                    table,
                    action: TableAction::ExplicitSplit {
                        split_point: split_point.into_bytes(),
                    },
                }
            }
            Command::MoveRegion {
                table,
                region_name,
                host,
            } => AdminRequest::ModifyTable {
                table,
                action: TableAction::MoveRegion { region_name, host },
            },
            Command::AlterStatus { table } => {
                AdminRequest::GetAlterStatus { table }
            }
            Command::Shutdown => AdminRequest::Shutdown,
            Command::StopMaster => AdminRequest::StopMaster,
            // column commands go through the dedicated stub helpers
            Command::AddColumn { .. } | Command::DeleteColumn { .. } => {
                unreachable!("handled before dispatch")
            }
        }
    }
}

fn print_reply(reply: AdminReply) -> Result<(), RangemasterError> {
    match reply {
        AdminReply::ClusterStatus { status } => {
            println!("version:       {}", status.version);
            println!("average load:  {:.2}", status.average_load);
            println!("live servers:  {}", status.servers.len());
            for server in status.servers {
                println!(
                    "  {} ({} regions)",
                    server.server_name(),
                    server.load.regions
                );
            }
            println!("dead servers:  {}", status.dead_servers.len());
            for server in status.dead_servers {
                println!("  {}", server);
            }
            println!(
                "in transition: {}",
                status.regions_in_transition.len()
            );
            for (region, state) in status.regions_in_transition {
                println!("  {} ({:?})", region, state);
            }
        }
        AdminReply::TableRegions { regions } => {
            for (region, server) in regions {
                println!(
                    "{} [{}, {}) -> {}",
                    region.region_name(),
                    key_display(&region.start_key),
                    key_display(&region.end_key),
                    server.unwrap_or_else(|| "(unassigned)".into()),
                );
            }
        }
        AdminReply::AlterStatus { pending, total } => {
            println!("{} of {} regions still to reopen", pending, total);
        }
        AdminReply::Error { error } => {
            return Err(error);
        }
        reply => {
            println!("{:?}", reply);
        }
    }
    Ok(())
}

/// Actual main function of the admin tool.
fn ctl_main() -> Result<(), RangemasterError> {
    let args = CliArgs::parse();

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .worker_threads(2)
        .thread_name("tokio-worker-ctl")
        .build()?;

    runtime.block_on(async move {
        let mut admin = AdminClient::connect(args.master).await?;
        let reply = match args.command {
            Command::AddColumn { table, family } => {
                admin
                    .add_column(&table, FamilySchema::new(family))
                    .await?
            }
            Command::DeleteColumn { table, family } => {
                admin.delete_column(&table, &family).await?
            }
            command => admin.request(&command.into_request()).await?,
        };
        print_reply(reply)?;
        admin.leave().await
    })
}

/// Main function of the admin tool.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = ctl_main() {
        pf_error!("ctl"; "command failed: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
