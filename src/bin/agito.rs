use anyhow::Result;
use clap::{Parser, Subcommand};

use agito::client::{self, ServerAddress, DEFAULT_SERVER, DEFAULT_USER};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "agito",
    about = "Git client for an agito server",
    after_help = "Any other command is passed through to git, e.g. `agito status`."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new bare repository on the agito server.
    Create {
        name: String,
        /// Server as host[:port].
        #[arg(long, env = "AGITO_SERVER", default_value = DEFAULT_SERVER)]
        server: String,
        /// SSH user to connect as.
        #[arg(long, env = "AGITO_USER", default_value = DEFAULT_USER)]
        user: String,
    },
    /// Clone a repository from an agito server.
    Clone {
        url: String,
        /// Extra arguments for `git clone`.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    #[command(external_subcommand)]
    Git(Vec<String>),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Create { name, server, user } => {
            let address = ServerAddress::parse(&server);
            let code = client::create_repo(&address, &user, &name).run().await?;
            if code == 0 {
                println!("Repository '{name}' created successfully on {server}");
                println!(
                    "Clone it with: agito clone {}",
                    client::clone_url(&address, &user, &name)
                );
            }
            code
        }
        Commands::Clone { url, args } => client::clone(&url, &args).run().await?,
        Commands::Git(args) => client::passthrough(&args).run().await?,
    };

    std::process::exit(code);
}
