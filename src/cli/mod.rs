pub mod auth;
pub mod config;
#[cfg(feature = "tui")]
pub mod dashboard;
pub mod ledgers;
pub mod search;
pub mod users;

use clap::{Args, Parser, Subcommand};

use crate::api::ApiClient;
use crate::error::{ConsultaError, Result};
use crate::guard::{authorize, Access, Route};
use crate::models::{ConnectionParams, Session};
use crate::normalize::Ident;
use crate::session::{FileStore, SessionStore};
use crate::settings::{load_settings, Settings};

#[derive(Parser)]
#[command(
    name = "consulta",
    version,
    about = "Municipal and notarial tax consultation from the terminal."
)]
pub struct Cli {
    /// More log output on stderr (-v info, -vv debug). CONSULTA_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Log in and store the session.
    Login {
        /// Account email (prompted if omitted)
        #[arg(long)]
        email: Option<String>,
    },
    /// Clear the stored session.
    Logout,
    /// Request a password recovery email.
    Recover {
        #[arg(long)]
        email: String,
    },
    /// Set a new password using the token from a recovery email.
    ResetPassword {
        /// Token from the recovery link
        token: String,
    },
    /// Change the password of the logged-in account.
    Passwd,
    /// Show the logged-in account.
    Whoami,
    /// Search a taxpayer by DNI or RUC across all entities.
    Search {
        /// Document number (8 to 11 digits)
        document: String,
        /// Only show entities whose name contains this text
        #[arg(long)]
        entity: Option<String>,
        /// Group rows by entity
        #[arg(long)]
        group: bool,
    },
    /// Sworn property-tax declarations (DDJJ).
    Ddjj {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Only declarations for this year
        #[arg(long)]
        year: Option<String>,
        /// Print the report URL of each declaration
        #[arg(long)]
        reports: bool,
    },
    /// Cashier receipts, grouped as the entity issued them.
    Receipts {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Fiscal year to query (all years if omitted)
        #[arg(long)]
        year: Option<i32>,
        /// Receipt number contains
        #[arg(long)]
        number: Option<String>,
        /// Every word must appear in the receipt memo
        #[arg(long)]
        memo: Option<String>,
        /// Show line items under each receipt
        #[arg(long)]
        detail: bool,
    },
    /// Vehicle tax records.
    Vehicles {
        #[command(flatten)]
        conn: ConnectionArgs,
    },
    /// Cadastral documents.
    Cadastral {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Fetch the document in this row (1-based)
        #[arg(long)]
        open: Option<usize>,
    },
    /// Property transfer tax (alcabala) records.
    Alcabala {
        #[command(flatten)]
        conn: ConnectionArgs,
        /// Print the report URL of each record
        #[arg(long)]
        reports: bool,
    },
    /// Print the report URL for one record.
    ReportUrl {
        /// ddjj or alcabala
        kind: String,
        /// Record id (ide_dec or ide_alc)
        #[arg(long)]
        id: String,
        /// Period (ide_eje or ano_eje)
        #[arg(long)]
        period: String,
        /// External database id
        #[arg(long)]
        bde: Option<String>,
    },
    /// Manage the organisation's users (administrators only).
    Users {
        #[command(subcommand)]
        command: UsersCommands,
    },
    /// Show or change settings.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Interactive dashboard.
    #[cfg(feature = "tui")]
    Dashboard,
}

#[derive(Args, Debug, Clone)]
pub struct ConnectionArgs {
    /// Connection id (ide_cnt from the search results)
    #[arg(long)]
    pub cnt: String,
    /// External database id (ide_bde from the search results)
    #[arg(long)]
    pub bde: String,
}

impl ConnectionArgs {
    pub fn params(&self) -> ConnectionParams {
        ConnectionParams {
            pide_cnt: Some(Ident::parse(&self.cnt)),
            ide_bde: Some(Ident::parse(&self.bde)),
        }
    }
}

#[derive(Subcommand)]
pub enum UsersCommands {
    /// List users grouped by organisation.
    List,
    /// Register a collaborator by national ID.
    Add {
        #[arg(long)]
        dni: String,
        #[arg(long)]
        email: String,
        /// Grant administrator rights
        #[arg(long)]
        admin: bool,
    },
    /// Activate or deactivate a user.
    Toggle {
        /// User id
        id: String,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print current settings.
    Show,
    /// Change one setting.
    Set { key: String, value: String },
}

/// Settings and the on-disk session store every command works from.
pub(crate) fn context() -> (Settings, SessionStore<FileStore>) {
    (load_settings(), SessionStore::open_default())
}

/// Run the route guard for a command. Redirects become errors.
pub(crate) fn require(store: &SessionStore<FileStore>, route: Route) -> Result<Session> {
    match authorize(store, &route) {
        Access::Authenticated(session) => Ok(session),
        Access::Public => store.get_session().ok_or(ConsultaError::NotAuthenticated),
        Access::Redirect(Route::Login) => Err(ConsultaError::NotAuthenticated),
        Access::Redirect(_) => Err(ConsultaError::Forbidden(
            "this command requires an administrator account".to_string(),
        )),
    }
}

pub(crate) fn client_for(settings: &Settings, session: &Session) -> Result<ApiClient> {
    ApiClient::new(settings, Some(session.token.clone()))
}

pub(crate) fn prompt(label: &str) -> Result<String> {
    use std::io::Write;
    print!("{label}");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}
