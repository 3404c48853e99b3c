use std::{error::Error, process::ExitCode, sync::Arc};

use clap::Parser;
use dualentry::{
    config::{AccountArgs, CliArgs, Command, DatabaseConfig},
    logging, AccountOptions, AccountRef, Backend, Config, Ledger, Metadata, Money, RetryPolicy,
    TransferRequest,
};
use dualentry_core::{BalanceStore, StorageError};
use dualentry_memory::InMemoryStore;
use dualentry_postgres::PostgresStore;
use dualentry_sqlite::SqliteStore;

fn main() -> ExitCode {
    let cli = CliArgs::parse();
    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };
    logging::init(&config.logging);

    match run(cli.command, config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn open_store(config: &DatabaseConfig) -> Result<Arc<dyn BalanceStore>, StorageError> {
    tracing::debug!(backend = ?config.backend, "Opening balance store");
    Ok(match config.backend {
        Backend::Memory => Arc::new(InMemoryStore::new()),
        Backend::Sqlite => Arc::new(SqliteStore::new(&config.url)?),
        Backend::Postgres => Arc::new(PostgresStore::new(&config.url)?),
    })
}

fn options(currency: Option<String>, scope: Option<String>) -> AccountOptions {
    AccountOptions {
        currency: currency.as_deref().map(Into::into),
        scope,
    }
}

fn account_options(args: &AccountArgs) -> AccountOptions {
    options(args.currency.clone(), args.scope.clone())
}

fn run(command: Command, config: Config) -> Result<(), Box<dyn Error>> {
    let store = open_store(&config.database)?;
    let ledger = Ledger::new(Arc::new(config.ledger), store);

    match command {
        Command::Transfer {
            from,
            to,
            amount,
            code,
            currency,
            from_scope,
            to_scope,
            metadata,
        } => {
            let currency = currency.unwrap_or_else(|| ledger.config().default_currency.to_string());
            let metadata: Metadata = match metadata {
                Some(json) => serde_json::from_str(&json)?,
                None => Metadata::new(),
            };
            let request = TransferRequest::new(
                Money::new(amount, currency.as_str()),
                AccountRef::named(&from, options(Some(currency.clone()), from_scope)),
                AccountRef::named(&to, options(Some(currency.clone()), to_scope)),
                &code,
            )
            .metadata(metadata);

            let receipt = ledger.transfer_with_retry(&request, &RetryPolicy::default())?;
            println!(
                "{} -> {}: {} ({} now {}, {} now {})",
                receipt.debit.account,
                receipt.credit.account,
                receipt.transfer.money,
                receipt.debit.account,
                receipt.transfer.from.balance,
                receipt.credit.account,
                receipt.transfer.to.balance,
            );
        }
        Command::Balance(args) => {
            let balance = ledger.balance(&args.account, &account_options(&args))?;
            println!("{}", balance);
        }
        Command::Lines(args) => {
            for line in ledger.lines(&args.account, &account_options(&args))? {
                println!(
                    "#{}\t{}\t{}\t{}\t{} -> #{}",
                    line.id,
                    line.code,
                    line.amount,
                    line.balance_amount,
                    line.partner,
                    line.partner_line_id.map(|id| id.to_string()).unwrap_or_default(),
                );
            }
        }
    }

    Ok(())
}
