use clap::{Parser, Subcommand};

/// dbprov: Self-service database provisioning
#[derive(Parser)]
#[command(name = "dbprov", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP API server
    Serve {
        /// Port to bind (defaults to DBPROV_PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Submit and inspect provisioning requests
    Request {
        #[command(subcommand)]
        command: RequestCommands,
    },

    /// Approve or reject pending requests
    Approval {
        #[command(subcommand)]
        command: ApprovalCommands,
    },

    /// Inspect the provisioned database catalog
    Database {
        #[command(subcommand)]
        command: DatabaseCommands,
    },

    /// Report requests left partially provisioned
    Reconcile,
}

#[derive(Subcommand)]
pub enum RequestCommands {
    /// Submit a new database request
    Submit {
        #[arg(long)]
        team: String,
        /// postgres, mysql, redis
        #[arg(long)]
        db_type: String,
        /// dev, staging, prod
        #[arg(long)]
        environment: String,
        /// small, medium, large
        #[arg(long)]
        size: String,
        #[arg(long)]
        purpose: String,
    },
    /// List requests, newest first
    List {
        #[arg(short, long)]
        status: Option<String>,
    },
    /// Show one request in full
    Show { request_id: String },
}

#[derive(Subcommand)]
pub enum ApprovalCommands {
    /// Approve a pending request (provisions immediately)
    Approve {
        request_id: String,
        #[arg(long)]
        approver: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Reject a pending request
    Reject {
        request_id: String,
        #[arg(long)]
        approver: String,
        #[arg(long)]
        notes: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum DatabaseCommands {
    /// List active databases with total monthly cost
    List,
}
