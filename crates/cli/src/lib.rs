pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

use commands::access::{CanArgs, ClaimArgs};
use commands::context::ActingAs;
use commands::requests::{
    ListArgs, PurchaseArgs, RejectArgs, ShowArgs, SubmitArgs, TransitionArgs,
};

#[derive(Debug, Parser)]
#[command(
    name = "fieldpo",
    about = "Field purchase-request operator CLI",
    long_about = "Submit, approve, reject and purchase field purchase requests against the local \
                  database or the hosted backend. Every command prints one JSON result.",
    after_help = "Examples:\n  fieldpo seed\n  fieldpo list --as u3 --awaiting\n  fieldpo submit --as u1 --project p1 --cost-code cc2 --vendor \"White Cap Supply\" --item \"80lb Concrete Mix:40:bags:6.50\"\n  fieldpo approve --as u3 r1"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations")]
    Migrate,
    #[command(about = "Load the deterministic demo organization into the local database")]
    Seed,
    #[command(about = "Inspect effective configuration values with source attribution and redaction")]
    Config,
    #[command(about = "Show the acting user's profile, organization and permissions")]
    Whoami(ActingAs),
    #[command(about = "List the organization's purchase requests, newest first")]
    List(ListArgs),
    #[command(about = "Show one request with its audit trail and the actions available to the acting user")]
    Show(ShowArgs),
    #[command(about = "Submit a new purchase request")]
    Submit(SubmitArgs),
    #[command(about = "Approve a pending request")]
    Approve(TransitionArgs),
    #[command(about = "Reject a pending request with a reason")]
    Reject(RejectArgs),
    #[command(about = "Mark an approved request as purchased")]
    Purchase(PurchaseArgs),
    #[command(about = "Check whether the acting user holds a permission")]
    Can(CanArgs),
    #[command(name = "claim-code", about = "Join an organization with an access code")]
    ClaimCode(ClaimArgs),
    #[command(name = "leave-org", about = "Leave the current organization")]
    LeaveOrg(ActingAs),
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Seed => commands::seed::run(),
        Command::Config => commands::config::run(),
        Command::Whoami(acting_as) => commands::access::whoami(acting_as),
        Command::List(args) => commands::requests::list(args),
        Command::Show(args) => commands::requests::show(args),
        Command::Submit(args) => commands::requests::submit(args),
        Command::Approve(args) => commands::requests::approve(args),
        Command::Reject(args) => commands::requests::reject(args),
        Command::Purchase(args) => commands::requests::purchase(args),
        Command::Can(args) => commands::access::can(args),
        Command::ClaimCode(args) => commands::access::claim_code(args),
        Command::LeaveOrg(acting_as) => commands::access::leave_org(acting_as),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::{Cli, Command};

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn acting_user_is_parsed_from_as() {
        let cli = Cli::try_parse_from(["fieldpo", "approve", "--as", "u3", "r1"]).expect("parse");

        let Command::Approve(args) = cli.command else {
            panic!("expected approve");
        };
        assert_eq!(args.acting_as.user_id, "u3");
        assert_eq!(args.request_id, "r1");
    }

    #[test]
    fn submit_needs_at_least_one_item() {
        let parsed = Cli::try_parse_from([
            "fieldpo", "submit", "--as", "u1", "--project", "p1", "--cost-code", "cc2", "--vendor",
            "Fastenal",
        ]);

        assert!(parsed.is_err());
    }

    #[test]
    fn wire_values_parse_as_arguments() {
        let cli = Cli::try_parse_from([
            "fieldpo",
            "list",
            "--as",
            "u2",
            "--status",
            "pending",
            "--awaiting",
        ])
        .expect("parse");

        let Command::List(args) = cli.command else {
            panic!("expected list");
        };
        assert_eq!(args.status.map(|status| status.as_str()), Some("pending"));
        assert!(args.awaiting);
    }
}
