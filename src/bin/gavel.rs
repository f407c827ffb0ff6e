//! gavel is a command-line client for a gavel auction cluster. It submits a
//! single command to the cluster and prints the result, following leader
//! hints across the given nodes.

#![warn(clippy::all)]

use gavel::auction::{Command, Output};
use gavel::errinput;
use gavel::error::Result;
use gavel::Client;

use std::collections::HashMap;

fn main() -> Result<()> {
    let node_arg = clap::Arg::new("node")
        .short('n')
        .long("node")
        .help("A cluster node's client address, as id=host:port (repeatable)")
        .action(clap::ArgAction::Append)
        .default_value("gavel=localhost:9605")
        .global(true);

    let args = clap::command!()
        .name("gavel")
        .about("A client for a gavel auction cluster.")
        .arg(node_arg)
        .subcommand_required(true)
        .subcommand(
            clap::Command::new("new-user")
                .about("Registers a new user")
                .arg(clap::Arg::new("username").required(true))
                .arg(clap::Arg::new("password").required(true)),
        )
        .subcommand(
            clap::Command::new("new-auction")
                .about("Opens a new auction")
                .arg(clap::Arg::new("user").required(true))
                .arg(clap::Arg::new("name").required(true))
                .arg(clap::Arg::new("price").required(true).help("Start price in minor units"))
                .arg(clap::Arg::new("description").long("description").default_value("")),
        )
        .subcommand(
            clap::Command::new("new-bid")
                .about("Places a bid on an auction")
                .arg(clap::Arg::new("user").required(true))
                .arg(clap::Arg::new("auction").required(true))
                .arg(clap::Arg::new("value").required(true)),
        )
        .subcommand(
            clap::Command::new("close-auction")
                .about("Closes an auction, awarding the highest bidder")
                .arg(clap::Arg::new("auction").required(true)),
        )
        .subcommand(clap::Command::new("status").about("Prints cluster status from the leader"))
        .get_matches();

    let mut addrs = HashMap::new();
    for node in args.get_many::<String>("node").unwrap() {
        let Some((id, addr)) = node.split_once('=') else {
            return errinput!("invalid node {node}, expected id=host:port");
        };
        addrs.insert(id.to_string(), addr.to_string());
    }
    let mut client = Client::new(addrs);

    // Commands carry client-supplied timestamps, so that applying them is
    // deterministic across the cluster.
    let now = || -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default()
    };

    let get = |args: &clap::ArgMatches, name: &str| -> String {
        args.get_one::<String>(name).unwrap().clone()
    };

    let command = match args.subcommand().unwrap() {
        ("new-user", args) => Command::NewUser {
            username: get(args, "username"),
            password: get(args, "password"),
        },
        ("new-auction", args) => Command::NewAuction {
            user: get(args, "user"),
            start_date: now(),
            obj_name: get(args, "name"),
            obj_desc: get(args, "description"),
            start_price: get(args, "price").parse()?,
        },
        ("new-bid", args) => Command::NewBid {
            user: get(args, "user"),
            auction_id: get(args, "auction").parse()?,
            value: get(args, "value").parse()?,
        },
        ("close-auction", args) => Command::CloseAuction {
            auction_id: get(args, "auction").parse()?,
            closing_date: now(),
        },
        ("status", _) => {
            let status = client.status()?;
            println!("{status:#?}");
            return Ok(());
        }
        (name, _) => return errinput!("unknown command {name}"),
    };

    match client.execute(&command)? {
        Output::UserCreated { username } => println!("Created user {username}"),
        Output::AuctionCreated { id } => println!("Opened auction {id}"),
        Output::BidPlaced { auction_id, value } => {
            println!("Placed bid of {value} on auction {auction_id}")
        }
        Output::AuctionClosed { id, winner: Some(winner), winning_bid: Some(bid) } => {
            println!("Closed auction {id}, won by {winner} at {bid}")
        }
        Output::AuctionClosed { id, .. } => println!("Closed auction {id} without bids"),
    }
    Ok(())
}
