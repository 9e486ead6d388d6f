mod aggregate;
mod api;
mod cli;
mod drilldown;
mod error;
mod fmt;
mod guard;
mod logging;
mod models;
mod normalize;
mod report;
mod session;
mod settings;
#[cfg(feature = "tui")]
mod tui;

use clap::{CommandFactory, Parser};

use cli::{Cli, Commands, ConfigCommands, UsersCommands};

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let Some(command) = cli.command else {
        run_default();
        return;
    };

    let result = match command {
        Commands::Login { email } => cli::auth::login(email),
        Commands::Logout => cli::auth::logout(),
        Commands::Recover { email } => cli::auth::recover(&email),
        Commands::ResetPassword { token } => cli::auth::reset_password(&token),
        Commands::Passwd => cli::auth::passwd(),
        Commands::Whoami => cli::auth::whoami(),
        Commands::Search {
            document,
            entity,
            group,
        } => cli::search::run(&document, entity.as_deref(), group),
        Commands::Ddjj {
            conn,
            year,
            reports,
        } => cli::ledgers::ddjj(&conn, year.as_deref(), reports),
        Commands::Receipts {
            conn,
            year,
            number,
            memo,
            detail,
        } => cli::ledgers::receipts(&conn, year, number, memo, detail),
        Commands::Vehicles { conn } => cli::ledgers::vehicles(&conn),
        Commands::Cadastral { conn, open } => cli::ledgers::cadastral(&conn, open),
        Commands::Alcabala { conn, reports } => cli::ledgers::alcabala(&conn, reports),
        Commands::ReportUrl {
            kind,
            id,
            period,
            bde,
        } => cli::ledgers::report(&kind, &id, &period, bde.as_deref()),
        Commands::Users { command } => match command {
            UsersCommands::List => cli::users::list(),
            UsersCommands::Add { dni, email, admin } => cli::users::add(&dni, &email, admin),
            UsersCommands::Toggle { id } => cli::users::toggle(&id),
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => cli::config::show(),
            ConfigCommands::Set { key, value } => cli::config::set(&key, &value),
        },
        #[cfg(feature = "tui")]
        Commands::Dashboard => cli::dashboard::run(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        if e.is_session_expired() {
            eprintln!("Run `consulta login` to start a new session.");
        }
        std::process::exit(1);
    }
}

/// Bare `consulta`: open the dashboard on a terminal, otherwise print help.
fn run_default() {
    #[cfg(feature = "tui")]
    {
        use std::io::IsTerminal;
        if std::io::stdout().is_terminal() {
            if let Err(e) = cli::dashboard::run() {
                eprintln!("Error: {e}");
                std::process::exit(1);
            }
            return;
        }
    }
    // Nothing useful to report if stdout is already gone.
    let _ = Cli::command().print_help();
}
