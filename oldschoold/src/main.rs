use oldschoold::agent::{AgentConfig, AgentRuntime, CliOverrides};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CliMode {
    Run,
    Once,
    Help,
}

#[derive(Debug, PartialEq, Eq)]
struct Cli {
    mode: CliMode,
    overrides: CliOverrides,
}

fn parse_cli<I>(args: I) -> anyhow::Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = CliMode::Run;
    let mut overrides = CliOverrides::default();
    let mut args = args.into_iter().skip(1);
    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag.to_string(), Some(value.to_string())),
            None => (arg, None),
        };
        let slot = match flag.as_str() {
            "--once" => {
                mode = CliMode::Once;
                continue;
            }
            "--help" | "-h" => {
                mode = CliMode::Help;
                continue;
            }
            "--name" => &mut overrides.name,
            "--join-node" => &mut overrides.endpoints,
            "--base-dir" => &mut overrides.base_dir,
            "--base-etcd-dir" => &mut overrides.base_key,
            other => anyhow::bail!("unknown argument: {other}"),
        };
        let value = match inline {
            Some(value) => value,
            None => args
                .next()
                .ok_or_else(|| anyhow::anyhow!("missing value for {flag}"))?,
        };
        *slot = Some(value);
    }
    Ok(Cli { mode, overrides })
}

fn print_usage() {
    println!(
        "Usage: oldschoold [--name N] [--join-node URLS] [--base-dir D] [--base-etcd-dir K] [--once]"
    );
    println!("  --name           Agent identity (OLDSCHOOL_NAME)");
    println!("  --join-node      Comma separated store endpoints (OLDSCHOOL_ENDPOINTS)");
    println!("  --base-dir       Local directory to mirror into (OLDSCHOOL_BASE_DIR)");
    println!("  --base-etcd-dir  Namespace key to mirror (OLDSCHOOL_BASE_KEY)");
    println!("  --once           Mirror one snapshot and exit");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = parse_cli(std::env::args())?;
    if cli.mode == CliMode::Help {
        print_usage();
        return Ok(());
    }
    oldschoold::logging::init()?;

    let config = AgentConfig::from_env(&cli.overrides)?;
    let runtime = AgentRuntime::bootstrap(config).await?;
    match cli.mode {
        CliMode::Once => runtime.run_once().await.map(|_| ()),
        _ => runtime.run().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(raw: &[&str]) -> Vec<String> {
        std::iter::once("oldschoold")
            .chain(raw.iter().copied())
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn defaults_to_run_without_overrides() {
        let cli = parse_cli(args(&[])).unwrap();
        assert_eq!(cli.mode, CliMode::Run);
        assert_eq!(cli.overrides, CliOverrides::default());
    }

    #[test]
    fn reads_flag_values_in_both_forms() {
        let cli = parse_cli(args(&[
            "--name",
            "agentA",
            "--join-node=http://a:4001,http://b:4001",
            "--base-dir",
            "/srv/mirror",
            "--base-etcd-dir=/base",
            "--once",
        ]))
        .unwrap();

        assert_eq!(cli.mode, CliMode::Once);
        assert_eq!(cli.overrides.name.as_deref(), Some("agentA"));
        assert_eq!(
            cli.overrides.endpoints.as_deref(),
            Some("http://a:4001,http://b:4001")
        );
        assert_eq!(cli.overrides.base_dir.as_deref(), Some("/srv/mirror"));
        assert_eq!(cli.overrides.base_key.as_deref(), Some("/base"));
    }

    #[test]
    fn supports_help() {
        assert_eq!(parse_cli(args(&["--help"])).unwrap().mode, CliMode::Help);
        assert_eq!(parse_cli(args(&["-h"])).unwrap().mode, CliMode::Help);
    }

    #[test]
    fn rejects_unknown_and_incomplete_arguments() {
        assert!(parse_cli(args(&["--logout"])).is_err());
        assert!(parse_cli(args(&["--name"])).is_err());
    }
}
