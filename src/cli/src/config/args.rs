#[derive(Debug, Clone, Default, clap::Parser)]
#[command(author, version, about, long_about = None)]
pub(crate) struct Values {
  /// Alternative configuration location
  #[arg(short, long)]
  pub(crate) config: Option<String>,

  /// Log everything
  #[arg(long)]
  pub(crate) trace: bool,
}

pub(crate) fn parse() -> Values {
  clap::Parser::parse()
}
