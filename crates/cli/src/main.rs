mod cli;
mod shutdown;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use reqwest::Url;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use ojc_core::config::{CrawlerConfig, config_path, load_config, save_config};
use ojc_core::crawler::Checkpoint;
use ojc_core::template::TemplateSet;
use ojc_engine::captcha::{self, HttpSolver};
use ojc_engine::oj::HttpConnector;
use ojc_engine::store::{JsonStore, Problem, Store, TaskKind};
use ojc_engine::task::{RunnerConfig, TaskRunner};

use crate::cli::{AccountsCommand, Cli, Command};
use crate::shutdown::spawn_ctrl_c_pause;

/// Problems and template sets loaded by `ojc import`.
#[derive(Debug, Deserialize)]
struct ImportFile {
    #[serde(default)]
    problems: Vec<Problem>,
    #[serde(default)]
    template_sets: Vec<TemplateSet>,
}

fn read_optional_file(path: Option<&PathBuf>) -> anyhow::Result<String> {
    match path {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("read {}", path.display())),
        None => Ok(String::new()),
    }
}

fn runner_config(config: &CrawlerConfig) -> RunnerConfig {
    RunnerConfig {
        accounts_per_crawl: config.accounts_per_crawl,
        default_password: config.default_password.clone(),
        username_prefix: config.username_prefix.clone(),
        email_domain: config.email_domain.clone(),
        ..RunnerConfig::default()
    }
}

fn build_connector(base_url: &Url, config: &CrawlerConfig) -> anyhow::Result<HttpConnector> {
    if let Some(endpoint) = &config.captcha_service_url {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid captcha_service_url {endpoint:?}"))?;
        captcha::install(Arc::new(
            HttpSolver::new(endpoint).context("build captcha solver")?,
        ));
    }
    Ok(HttpConnector::new(base_url.clone(), captcha::installed()))
}

async fn run_and_report(
    store: Arc<dyn Store>,
    connector: HttpConnector,
    config: &CrawlerConfig,
    task_id: Uuid,
) -> anyhow::Result<()> {
    spawn_ctrl_c_pause(store.clone(), task_id);

    let runner = TaskRunner::new(store.clone(), Arc::new(connector), runner_config(config));
    runner.run_task(task_id).await?;

    let task = store.task(task_id)?;
    println!(
        "task {} finished as {:?} (progress {}%)",
        task.id, task.status, task.progress
    );
    if let Some(result) = &task.result {
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    if let TaskKind::Crawl { problem, .. } = &task.kind {
        let testcases = store.testcases(problem)?;
        println!("{} test cases extracted for {problem}", testcases.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config = match load_config() {
        Ok(Some(config)) => config,
        Ok(None) => CrawlerConfig::default(),
        Err(err) => {
            eprintln!("warning: failed to read config (using defaults): {err:#}");
            CrawlerConfig::default()
        }
    };
    let base_url = match &cli.base_url {
        Some(url) => url.clone(),
        None => Url::parse(&config.oj_base_url)
            .with_context(|| format!("invalid oj_base_url {:?}", config.oj_base_url))?,
    };

    let store: Arc<dyn Store> = Arc::new(JsonStore::open(&cli.store)?);

    match cli.command {
        Command::Crawl {
            problem,
            source,
            header_file,
            footer_file,
        } => {
            let header_code = read_optional_file(header_file.as_ref())?;
            let footer_code = read_optional_file(footer_file.as_ref())?;

            // The job queue delivers at least once; reuse the in-flight task
            // for this problem instead of starting a competing crawl.
            let task = match store.find_active_crawl(&problem)? {
                Some(task) => {
                    println!("reusing in-flight task {} for {problem}", task.id);
                    task
                }
                None => store.create_task(TaskKind::Crawl {
                    problem,
                    template_set: source,
                    header_code,
                    footer_code,
                    checkpoint: None,
                })?,
            };

            let connector = build_connector(&base_url, &config)?;
            run_and_report(store, connector, &config, task.id).await
        }

        Command::CreateAccounts { quantity } => {
            let task = store.create_task(TaskKind::CreateAccounts { quantity })?;
            let connector = build_connector(&base_url, &config)?;
            run_and_report(store, connector, &config, task.id).await
        }

        Command::Resume {
            task_id,
            checkpoint_file,
        } => {
            let checkpoint = match checkpoint_file {
                Some(path) => {
                    let raw = std::fs::read_to_string(&path)
                        .with_context(|| format!("read {}", path.display()))?;
                    Some(serde_json::from_str::<Checkpoint>(&raw).context("parse checkpoint")?)
                }
                None => None,
            };
            store.requeue_task(task_id, checkpoint)?;

            let connector = build_connector(&base_url, &config)?;
            run_and_report(store, connector, &config, task_id).await
        }

        Command::Status { task_id } => {
            let task = store.task(task_id)?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            Ok(())
        }

        Command::Import { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("read {}", file.display()))?;
            let import: ImportFile = serde_json::from_str(&raw).context("parse import file")?;

            let (problems, template_sets) = (import.problems.len(), import.template_sets.len());
            for problem in import.problems {
                store.upsert_problem(problem)?;
            }
            for set in import.template_sets {
                store.upsert_template_set(set)?;
            }
            println!("imported {problems} problems, {template_sets} template sets");
            Ok(())
        }

        Command::InitConfig => {
            let path = config_path()?;
            if path.exists() {
                println!("config already exists at {}", path.display());
            } else {
                save_config(&CrawlerConfig::default())?;
                println!("wrote default config to {}", path.display());
            }
            Ok(())
        }

        Command::Accounts { command } => match command {
            AccountsCommand::List => {
                for account in store.accounts()? {
                    let last_used = account
                        .last_used
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "{:<36} {:?} (last used: {last_used})",
                        account.username, account.status
                    );
                }
                Ok(())
            }
            AccountsCommand::Disable { username } => {
                store.disable_account(&username)?;
                println!("account {username} disabled");
                Ok(())
            }
        },
    }
}
