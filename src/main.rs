use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{arg, ArgMatches, Command};
use tabwriter::TabWriter;
use tokio::sync::watch;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};
use ulid::Ulid;
use url::Url;

use bursar::catalog::{Institution, InstitutionCatalog, DEFAULT_TTL_HOURS};
use bursar::connections::{display_connections_table, ConnectionManager};
use bursar::extract::Extractor;
use bursar::normalize::Normalizer;
use bursar::oauth::{redirect, OAuthConnector};
use bursar::settings::{self, Provider, Settings};
use bursar::store::SqliteStore;
use bursar::sync::{display_report_table, RunOpts, SyncOrchestrator};
use bursar::upstream::aggregator::AggregatorClient;
use bursar::upstream::mailbox::MailboxClient;
use bursar::vault::{CredentialVault, KeyringVault};
use bursar::CLIENT_NAME;

fn cli() -> Command<'static> {
    Command::new(CLIENT_NAME)
        .about(
            "The bursar utility pulls financial activity from a bank \
             aggregator and a receipt mailbox into a local ledger.",
        )
        .version("0.1.0")
        .subcommand_required(true)
        .allow_external_subcommands(false)
        .arg(arg!(CONFIG: -c --config [FILE] "Sets a custom config file"))
        .arg(arg!(verbose: -v --verbose "Enables logging output"))
        .subcommand(Command::new("init").about("Writes a starter configuration file."))
        .subcommand(
            Command::new("institutions")
                .subcommand_required(true)
                .about("Institutions available for connection.")
                .subcommand(
                    Command::new("list")
                        .about("Prints the institution catalog, served from the local cache.")
                        .arg(arg!(refresh: -r --refresh "Bypasses the cache and refetches the catalog.")),
                ),
        )
        .subcommand(
            Command::new("connection")
                .subcommand_required(true)
                .about("Manages bank account connections.")
                .subcommand(
                    Command::new("add")
                        .about("Connects an institution. Prompts for the banking password; it is forwarded to the aggregator and never stored.")
                        .arg(arg!(institution: <INSTITUTION> "Institution id, see `institutions list`."))
                        .arg(arg!(login: -l --login <LOGIN> "Banking login id.")),
                )
                .subcommand(Command::new("status").about("Displays all connections and their current status."))
                .subcommand(
                    Command::new("delete")
                        .about("Deletes a connection upstream and locally.")
                        .arg(arg!(id: <ID> "The connection id to delete.")),
                ),
        )
        .subcommand(
            Command::new("authorize")
                .about("Runs the browser consent flow for a provider and stores the tokens in the OS credential store.")
                .arg(arg!(provider: <PROVIDER> "Which provider to authorize: bank or mailbox.")),
        )
        .subcommand(
            Command::new("sync")
                .subcommand_required(true)
                .about("Pulls transactions into the local ledger.")
                .subcommand(
                    Command::new("run")
                        .about("Syncs every active connection, and the mailbox when requested.")
                        .arg(arg!(connection: --connection [ID] "Restricts the run to one connection."))
                        .arg(arg!(mailbox: --mailbox "Also extracts receipts from the mailbox."))
                        .arg(arg!(cursor: --cursor [CURSOR] "Resumes an interrupted run from this cursor.")),
                ),
        )
}

/// Shared wiring behind every subcommand except `init`: configuration, the
/// local ledger, and the credential vault.
struct App {
    settings: Settings,
    store: Arc<SqliteStore>,
    vault: Arc<dyn CredentialVault>,
}

impl App {
    async fn open(config: Option<&str>) -> Result<Self> {
        let settings = Settings::new(config).context("read configuration, run `bursar init` first")?;

        if let Some(parent) = Path::new(&settings.db_file).parent() {
            std::fs::create_dir_all(parent)?;
        }
        let store = Arc::new(
            SqliteStore::new(&format!("sqlite://{}?mode=rwc", settings.db_file)).await?,
        );

        Ok(App {
            settings,
            store,
            vault: Arc::new(KeyringVault::new(CLIENT_NAME)),
        })
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.sync.request_timeout_secs)
    }

    fn connector(&self, provider: &Provider, account: &str) -> Arc<OAuthConnector> {
        Arc::new(OAuthConnector::new(
            provider.clone(),
            Arc::clone(&self.vault),
            account,
            self.settings.sync.refresh_skew_secs,
            self.request_timeout(),
        ))
    }

    fn aggregator(&self) -> Arc<AggregatorClient> {
        Arc::new(AggregatorClient::new(
            self.connector(&self.settings.bank, "bank"),
            &self.settings.bank.api_url,
            self.request_timeout(),
        ))
    }

    fn mailbox(&self) -> Arc<MailboxClient> {
        Arc::new(MailboxClient::new(
            self.connector(&self.settings.mailbox, "mailbox"),
            &self.settings.mailbox.api_url,
            self.request_timeout(),
        ))
    }
}

fn init(config: Option<&str>) -> Result<()> {
    let path = config
        .map(str::to_string)
        .unwrap_or_else(settings::default_config_path);
    let path = Path::new(&path);

    if path.exists() {
        println!("configuration already exists at {}", path.display());
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, settings::CONFIG_TEMPLATE)?;
    println!("wrote starter configuration to {}", path.display());
    println!("fill in the provider credentials, then run `bursar authorize bank`");

    Ok(())
}

async fn institutions(app: &App, matches: &ArgMatches) -> Result<()> {
    let catalog = InstitutionCatalog::new(
        Arc::clone(&app.store),
        app.aggregator(),
        DEFAULT_TTL_HOURS,
    );
    let list = catalog.list(matches.is_present("refresh")).await?;
    print!("{}", display_institutions_table(&list)?);

    Ok(())
}

async fn connection(app: &App, matches: &ArgMatches) -> Result<()> {
    let manager = ConnectionManager::new(Arc::clone(&app.store), app.aggregator());

    match matches.subcommand() {
        Some(("add", add)) => {
            let institution = add.value_of("institution").expect("required arg");
            let login = add.value_of("login").context("--login is required")?;
            let password = prompt_password()?;

            let connection = manager.create(institution, login, &password).await?;
            println!("connection {} created, verifying...", connection.id);

            let status = manager
                .poll_until_settled(&connection.id, 15, Duration::from_secs(2))
                .await?;
            println!("connection {} is {}", connection.id, status.to_string());
        }
        Some(("status", _)) => {
            let connections = manager.list().await?;
            print!("{}", display_connections_table(&connections)?);
        }
        Some(("delete", delete)) => {
            let id = delete.value_of("id").expect("required arg");
            manager.delete(id).await?;
            println!("connection {} deleted", id);
        }
        _ => unreachable!("subcommand is required"),
    }

    Ok(())
}

async fn authorize(app: &App, matches: &ArgMatches) -> Result<()> {
    let (provider, account) = match matches.value_of("provider").expect("required arg") {
        "bank" => (&app.settings.bank, "bank"),
        "mailbox" => (&app.settings.mailbox, "mailbox"),
        other => bail!("unknown provider {}, expected bank or mailbox", other),
    };

    let connector = app.connector(provider, account);
    // Re-consent starts clean; any stale token set for this account is
    // dropped before the new flow begins.
    connector.disconnect().await?;

    let state = Ulid::new().to_string();
    let url = connector.authorization_url(&state).await?;
    println!("Open this URL in your browser to grant access:\n\n  {}\n", url);

    let redirect_uri = Url::parse(&provider.redirect_uri).context("parse redirect_uri")?;
    let addr: SocketAddr = format!(
        "{}:{}",
        redirect_uri.host_str().context("redirect_uri has no host")?,
        redirect_uri.port().unwrap_or(80),
    )
    .parse()?;
    let code = redirect::capture_code(addr, &state, Duration::from_secs(300)).await?;

    connector.exchange_code(&code).await?;
    println!("{} authorized, tokens stored in the credential vault", account);

    Ok(())
}

async fn sync(app: &App, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("run", run)) => {
            let orchestrator = Arc::new(
                SyncOrchestrator::new(
                    Arc::clone(&app.store),
                    app.aggregator(),
                    Extractor::default(),
                    Normalizer::default(),
                    app.settings.sync.clone(),
                )
                .with_mailbox(app.mailbox()),
            );

            let (cancel_tx, cancel_rx) = watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    eprintln!("interrupt received, finishing the current page...");
                    cancel_tx.send(true).ok();
                }
            });

            let opts = RunOpts {
                connection: run.value_of("connection").map(str::to_string),
                include_mailbox: run.is_present("mailbox"),
                cursor: run.value_of("cursor").map(str::to_string),
            };
            let report = orchestrator.run(opts, cancel_rx).await?;
            print!("{}", display_report_table(&report)?);
        }
        _ => unreachable!("subcommand is required"),
    }

    Ok(())
}

fn prompt_password() -> Result<String> {
    print!("Banking password: ");
    std::io::stdout().flush()?;
    let mut password = String::new();
    std::io::stdin().read_line(&mut password)?;

    Ok(password.trim_end().to_string())
}

fn display_institutions_table(institutions: &[Institution]) -> Result<String> {
    let mut tw = TabWriter::new(vec![]);
    writeln!(tw, "ID\tName\tCountry")?;
    for ins in institutions {
        writeln!(tw, "{}\t{}\t{}", ins.id, ins.name, ins.country)?;
    }

    Ok(String::from_utf8(tw.into_inner()?)?)
}

async fn run() -> Result<()> {
    let matches = cli().get_matches();

    if matches.is_present("verbose") {
        tracing_subscriber::registry()
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let config = matches.value_of("CONFIG");
    match matches.subcommand() {
        Some(("init", _)) => init(config)?,
        Some(("institutions", sub)) => match sub.subcommand() {
            Some(("list", list)) => institutions(&App::open(config).await?, list).await?,
            _ => unreachable!("subcommand is required"),
        },
        Some(("connection", sub)) => connection(&App::open(config).await?, sub).await?,
        Some(("authorize", sub)) => authorize(&App::open(config).await?, sub).await?,
        Some(("sync", sub)) => sync(&App::open(config).await?, sub).await?,
        None => unreachable!("subcommand is required"),
        _ => unreachable!(),
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{:#}", err);
        std::process::exit(1);
    }
}
