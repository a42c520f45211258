use anyhow::{bail, Context};
use clap::Parser;
use policy_pushdown::{
    AppConfig, Compiled, ExecutionContext, PartialQueries, PolicyTranslator,
};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::time::Duration;

/// 交互式控制台: 把部分求值结果翻译成数据源查询并空跑
#[derive(Parser, Debug)]
#[command(author, version, about = "policy pushdown console", long_about = None)]
struct Args {
    /// JSON 配置文件
    #[arg(short, long, default_value = "pushdown.json")]
    config: PathBuf,

    /// 目标数据源, 缺省为配置中的第一个
    #[arg(short, long)]
    datastore: Option<String>,

    /// 翻译一次该文件后退出, 不进入交互模式
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// 跳过无法翻译的表达式而不是报错
    #[arg(long)]
    skip_unknown: bool,

    /// 单次决策超时 (毫秒)
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
}

struct Console {
    translator: PolicyTranslator,
    datastore: String,
    timeout: Duration,
}

impl Console {
    async fn evaluate(&self, input: &str) -> anyhow::Result<()> {
        let queries = PartialQueries::from_json_str(input).context("input is not a partial evaluation result")?;

        println!("\n[步骤 1]: 翻译到数据源 `{}`...", self.datastore);
        match self.translator.compile(&queries, &self.datastore)? {
            Compiled::Denied => println!("没有剩余查询 -> DENIED"),
            Compiled::Allowed => println!("存在无条件分支 -> ALLOWED"),
            Compiled::Pushdown { ast, query } => {
                println!("\n[Query-AST]:\n{}", ast);
                println!("\n[生成的查询]:\n{}", query);
            }
        }

        println!("\n[步骤 2]: 空跑执行...");
        let ctx = ExecutionContext::new().with_timeout(self.timeout);
        let allowed = self.translator.process(&ctx, &queries, &self.datastore).await?;
        println!("决策: {}", if allowed { "ALLOWED" } else { "DENIED" });
        Ok(())
    }

    /// Returns `false` when the console should exit.
    async fn handle(&mut self, line: &str) -> anyhow::Result<bool> {
        let mut parts = line.splitn(2, char::is_whitespace);
        match (parts.next().unwrap_or_default(), parts.next().map(str::trim)) {
            (":q", _) | (":quit", _) => return Ok(false),
            (":help", _) => print_help(),
            (":use", Some(alias)) => {
                if self.translator.datastore(alias).is_none() {
                    bail!("unknown datastore `{}`", alias);
                }
                self.datastore = alias.to_string();
                println!("✅ 当前数据源: {}", alias);
            }
            (":load", Some(path)) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("cannot read {}", path))?;
                self.evaluate(&content).await?;
            }
            (":use", None) | (":load", None) => bail!("missing argument, see :help"),
            _ => self.evaluate(line).await?,
        }
        Ok(true)
    }
}

fn print_help() {
    println!(":load <file>   翻译文件中的部分求值结果");
    println!(":use <alias>   切换目标数据源");
    println!(":help          显示帮助");
    println!(":quit          退出");
    println!("其他输入按单行 JSON 处理");
}

fn init_tracing() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    let filter_layer = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();

    println!("--- Policy Pushdown: 部分求值结果到数据源查询 ---");
    let config = AppConfig::from_json_file(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let translator = PolicyTranslator::dry_run(&config)?.with_skip_unknown(args.skip_unknown);

    let datastore = match args.datastore {
        Some(alias) => alias,
        None => match translator.aliases().next() {
            Some(alias) => alias.to_string(),
            None => bail!("no datastores configured in {}", args.config.display()),
        },
    };
    if translator.datastore(&datastore).is_none() {
        bail!("unknown datastore `{}`", datastore);
    }

    println!("\n[配置信息]:");
    for alias in translator.aliases() {
        println!("  {} -> {:?}", alias, config.datastore(alias)?.kind);
    }

    let mut console = Console {
        translator,
        datastore,
        timeout: Duration::from_millis(args.timeout_ms),
    };

    if let Some(input) = args.input {
        let content = std::fs::read_to_string(&input)
            .with_context(|| format!("cannot read {}", input.display()))?;
        return console.evaluate(&content).await;
    }

    let mut editor = DefaultEditor::new()?;
    print_help();
    loop {
        match editor.readline(&format!("{}> ", console.datastore)) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                editor.add_history_entry(line)?;
                match console.handle(line).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => println!("✗ {:#}", e),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}
