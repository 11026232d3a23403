//! platcheck - exercise the netplat cache and sync engine on a live kernel.
//!
//! `scenario` builds a test interface with an fq_codel root qdisc, an
//! ingress qdisc and a matchall filter on each, reporting one status per
//! step. `probe` prints the capability flags and `show` dumps the cache.

use std::io::{self, Write};
use std::process;

use clap::{ArgAction, Parser, Subcommand};
use netplat::netlink::NetlinkSocket;
use netplat::{
    ApplyMode, Error, FqCodelParams, Link, ObjectKind, Platform, PlatformConfig,
    PlatformObject, Qdisc, Result, Status, TcAction, TcHandle, Tfilter,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "platcheck", version, about = "Network platform diagnostic harness")]
struct Cli {
    /// Output JSON.
    #[arg(short = 'j', long, global = true)]
    json: bool,

    /// Run inside the named network namespace.
    #[arg(short = 'n', long, global = true)]
    netns: Option<String>,

    /// Log more (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a test interface and run the qdisc/filter scenario.
    #[command(visible_alias = "s")]
    Scenario {
        /// Name of the dummy interface to create.
        #[arg(long, default_value = "test0")]
        link: String,

        /// Delete the interface when done.
        #[arg(long)]
        cleanup: bool,
    },

    /// Print kernel capability flags.
    #[command(visible_alias = "p")]
    Probe,

    /// Show cached kernel objects.
    Show {
        /// Only objects of this kind.
        #[arg(long, value_parser = parse_kind)]
        kind: Option<ObjectKind>,

        /// Only objects owned by this interface.
        #[arg(long)]
        dev: Option<String>,
    },
}

fn parse_kind(s: &str) -> std::result::Result<ObjectKind, String> {
    ObjectKind::from_name(s).ok_or_else(|| {
        let names: Vec<_> = ObjectKind::ALL.iter().map(|k| k.name()).collect();
        format!("unknown kind {:?}, expected one of: {}", s, names.join(", "))
    })
}

#[derive(Serialize)]
struct StepReport {
    step: String,
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        _ => tracing::Level::DEBUG,
    };
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => process::exit(1),
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(2);
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    let mut config = PlatformConfig::new();
    if let Some(name) = &cli.netns {
        config = config.namespace_named(name);
    }
    let mut platform = Platform::open(config).await?;

    match cli.command {
        Command::Scenario { link, cleanup } => scenario(&mut platform, &link, cleanup, cli.json).await,
        Command::Probe => probe(&mut platform, cli.json).await,
        Command::Show { kind, dev } => show(&platform, kind, dev.as_deref(), cli.json),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value).map_err(io::Error::from)?;
    writeln!(out)?;
    Ok(())
}

async fn apply_step(platform: &mut Platform<NetlinkSocket>, object: PlatformObject) -> StepReport {
    let step = object.to_string();
    match platform.apply(object, ApplyMode::Add).await {
        Ok(outcome) => StepReport {
            step,
            status: outcome.status(),
            detail: None,
        },
        Err(e) => StepReport {
            step,
            status: e.status(),
            detail: Some(e.to_string()),
        },
    }
}

async fn scenario(platform: &mut Platform<NetlinkSocket>, name: &str, cleanup: bool, json: bool) -> Result<bool> {
    let mut reports = vec![apply_step(platform, Link::dummy(name).up(true).into()).await];

    if let Some(ifindex) = platform.link_by_name(name).map(|l| l.ifindex) {
        let egress = TcHandle::new(0x8003, 0);
        let steps: Vec<PlatformObject> = vec![
            Qdisc::fq_codel(ifindex, egress, FqCodelParams::default()).into(),
            Qdisc::ingress(ifindex).into(),
            Tfilter::matchall(ifindex, egress, TcAction::simple("Egress")).into(),
            Tfilter::matchall(ifindex, TcHandle::INGRESS_QDISC, TcAction::simple("Ingress")).into(),
        ];
        for step in steps {
            reports.push(apply_step(platform, step).await);
        }

        let mut parents: Vec<TcHandle> = platform
            .cache()
            .iter_by_interface(ifindex)
            .filter_map(|o| match o {
                PlatformObject::Tfilter(f) => Some(f.parent),
                _ => None,
            })
            .collect();
        parents.sort();
        let mut expected = vec![egress, TcHandle::INGRESS_QDISC];
        expected.sort();
        let listed = parents == expected;
        reports.push(StepReport {
            step: format!("list filters on {}", name),
            status: if listed {
                Status::Success
            } else {
                Status::NotFound
            },
            detail: (!listed).then(|| format!("found filters at {:?}", parents)),
        });
    }

    if cleanup {
        let status = match platform.apply(Link::dummy(name).into(), ApplyMode::Delete).await {
            Ok(outcome) => outcome.status(),
            Err(e) => e.status(),
        };
        reports.push(StepReport {
            step: format!("delete link {}", name),
            status,
            detail: None,
        });
    }

    if json {
        print_json(&reports)?;
    } else {
        for r in &reports {
            match &r.detail {
                Some(detail) => println!("{:<16} {}: {}", r.status.to_string(), r.step, detail),
                None => println!("{:<16} {}", r.status.to_string(), r.step),
            }
        }
    }
    Ok(reports.iter().all(|r| r.status == Status::Success))
}

async fn probe(platform: &mut Platform<NetlinkSocket>, json: bool) -> Result<bool> {
    let support = platform.kernel_support().await?;
    let report = support.report();
    if json {
        let map: serde_json::Map<String, serde_json::Value> = report
            .into_iter()
            .map(|(name, on)| (name.to_owned(), serde_json::Value::Bool(on)))
            .collect();
        print_json(&map)?;
    } else {
        for (name, on) in report {
            println!("{:<14} {}", name, if on { "yes" } else { "no" });
        }
    }
    Ok(true)
}

fn show(platform: &Platform<NetlinkSocket>, kind: Option<ObjectKind>, dev: Option<&str>, json: bool) -> Result<bool> {
    let ifindex = match dev {
        Some(name) => Some(
            platform
                .link_by_name(name)
                .map(|l| l.ifindex)
                .ok_or_else(|| Error::NotFound(format!("interface {}", name)))?,
        ),
        None => None,
    };
    let kinds: Vec<ObjectKind> = match kind {
        Some(kind) => vec![kind],
        None => ObjectKind::ALL.to_vec(),
    };

    let objects: Vec<&PlatformObject> = kinds
        .into_iter()
        .flat_map(|k| platform.cache().iter(k))
        .filter(|o| ifindex.is_none() || o.ifindex() == ifindex)
        .collect();

    if json {
        print_json(&objects)?;
    } else {
        for object in objects {
            println!("{}", object);
        }
    }
    Ok(true)
}
