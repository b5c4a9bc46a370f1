//! relayfee CLI - pay relayer fees and inspect fee state on a node

mod commands;

use clap::{Parser, Subcommand};
use colored::Colorize;
use commands::{parse_packet_id, ApiClient};
use relayfee_core::{Address, Amount, ChannelId, Denom, PortId};
use relayfee_fee::{
    Fee, FeeReceipt, IncentivizedPacket, MsgPayPacketFee, MsgPayPacketFeeAsync,
    MsgRegisterCounterpartyPayee, MsgRegisterPayee, PacketFee,
};

#[derive(Parser)]
#[command(name = "relayfee")]
#[command(about = "relayfee - relayer fee middleware CLI")]
#[command(version)]
struct Cli {
    /// Node URL
    #[arg(short, long, default_value = "http://127.0.0.1:8080")]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

/// Packet and fee arguments shared by both pay commands
#[derive(clap::Args)]
struct PayArgs {
    /// Source port of the packet
    #[arg(long, default_value = "transfer")]
    port: String,

    /// Source channel of the packet
    #[arg(long)]
    channel: String,

    /// Packet sequence
    #[arg(long)]
    sequence: u64,

    /// Fee for delivering the packet
    #[arg(long, default_value_t = 0)]
    recv_fee: u128,

    /// Fee for relaying the acknowledgement back
    #[arg(long, default_value_t = 0)]
    ack_fee: u128,

    /// Fee for relaying a timeout
    #[arg(long, default_value_t = 0)]
    timeout_fee: u128,

    #[arg(long, default_value = "stake")]
    denom: String,

    /// Payer and refund address
    #[arg(long)]
    signer: String,

    /// Relayer allowed to earn the fee, repeatable; anyone when omitted
    #[arg(long = "relayer")]
    relayers: Vec<String>,
}

impl PayArgs {
    fn fee(&self) -> anyhow::Result<Fee> {
        Ok(Fee::new(
            Denom::new(self.denom.clone())?,
            Amount(self.recv_fee),
            Amount(self.ack_fee),
            Amount(self.timeout_fee),
        ))
    }

    fn relayers(&self) -> anyhow::Result<Vec<Address>> {
        Ok(self
            .relayers
            .iter()
            .map(|r| r.parse())
            .collect::<Result<Vec<Address>, _>>()?)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Pay a fee for a packet in flight
    PayFee(PayArgs),

    /// Pay a fee for a packet that may not be sent yet
    PayFeeAsync(PayArgs),

    /// Set where a relayer on this chain is paid ack and timeout fees
    RegisterPayee {
        #[arg(long, default_value = "transfer")]
        port: String,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        relayer: String,
        #[arg(long)]
        payee: String,
    },

    /// Set the counterparty address a relayer wants its receive fee paid to
    RegisterCounterpartyPayee {
        #[arg(long, default_value = "transfer")]
        port: String,
        #[arg(long)]
        channel: String,
        #[arg(long)]
        relayer: String,
        #[arg(long)]
        counterparty_payee: String,
    },

    /// List packets with outstanding fees
    Packets {
        /// Restrict to one channel (requires --port)
        #[arg(long)]
        channel: Option<String>,
        #[arg(long, default_value = "transfer")]
        port: String,
    },

    /// Show the fee records of one packet
    Packet {
        port: String,
        channel: String,
        sequence: u64,
    },

    /// Show the registered payee of a relayer
    Payee { channel: String, relayer: String },

    /// Show the registered counterparty payee of a relayer
    CounterpartyPayee { channel: String, relayer: String },

    /// List fee-enabled channels
    Channels,

    /// Show account balances
    Balance { address: String },

    /// Node status
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("{} {}", "❌ Error:".red().bold(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let api = ApiClient::new(&cli.node)?;

    match cli.command {
        Commands::PayFee(args) => {
            let msg = MsgPayPacketFee {
                packet_id: parse_packet_id(&args.port, &args.channel, args.sequence)?,
                fee: args.fee()?,
                signer: args.signer.parse()?,
                relayers: args.relayers()?,
            };
            let receipt = api.pay_packet_fee(&msg).await?;
            print_receipt(&receipt);
        }

        Commands::PayFeeAsync(args) => {
            let msg = MsgPayPacketFeeAsync {
                packet_id: parse_packet_id(&args.port, &args.channel, args.sequence)?,
                packet_fee: PacketFee::new(args.fee()?, args.signer.parse()?, args.relayers()?),
            };
            let receipt = api.pay_packet_fee_async(&msg).await?;
            print_receipt(&receipt);
        }

        Commands::RegisterPayee {
            port,
            channel,
            relayer,
            payee,
        } => {
            let msg = MsgRegisterPayee {
                port_id: port.parse()?,
                channel_id: channel.parse()?,
                relayer: relayer.parse()?,
                payee: payee.parse()?,
            };
            let registered = api.register_payee(&msg).await?;
            println!("{}", "✅ Payee registered".green());
            println!("Relayer: {}", registered.relayer);
            println!("Payee:   {}", registered.payee);
        }

        Commands::RegisterCounterpartyPayee {
            port,
            channel,
            relayer,
            counterparty_payee,
        } => {
            let msg = MsgRegisterCounterpartyPayee {
                port_id: port.parse()?,
                channel_id: channel.parse()?,
                relayer: relayer.parse()?,
                counterparty_payee: counterparty_payee.parse()?,
            };
            let registered = api.register_counterparty_payee(&msg).await?;
            println!("{}", "✅ Counterparty payee registered".green());
            println!("Relayer:            {}", registered.relayer);
            println!("Counterparty payee: {}", registered.counterparty_payee);
        }

        Commands::Packets { channel, port } => {
            let packets = match channel {
                Some(channel) => {
                    let port_id: PortId = port.parse()?;
                    let channel_id: ChannelId = channel.parse()?;
                    api.incentivized_packets(Some((&port_id, &channel_id))).await?
                }
                None => api.incentivized_packets(None).await?,
            };

            if packets.is_empty() {
                println!("No packets with outstanding fees.");
            } else {
                println!("{:<36} {:>10} {:>10} {:>10} {:>8}", "Packet", "Recv", "Ack", "Timeout", "Records");
                println!("{:-<36} {:->10} {:->10} {:->10} {:->8}", "", "", "", "", "");
                for packet in &packets {
                    print_packet_row(packet);
                }
            }
        }

        Commands::Packet {
            port,
            channel,
            sequence,
        } => {
            let fees = api.packet(&parse_packet_id(&port, &channel, sequence)?).await?;
            println!("{}", format!("Packet {}", fees.packet_id).bold());
            match fees.status {
                Some(status) => println!("Status:    {:?}", status),
                None => println!("Status:    {}", "queued".yellow()),
            }
            if let Some(total) = &fees.total_fee {
                println!("Total fee: {}", total);
            }
            for (i, record) in fees.packet_fees.iter().enumerate() {
                print_record(i, record, false);
            }
            for (i, record) in fees.queued_fees.iter().enumerate() {
                print_record(i, record, true);
            }
        }

        Commands::Payee { channel, relayer } => {
            let info = api.payee(&channel.parse()?, &relayer.parse()?).await?;
            print_payee("Payee", info.relayer, info.payee);
        }

        Commands::CounterpartyPayee { channel, relayer } => {
            let info = api
                .counterparty_payee(&channel.parse()?, &relayer.parse()?)
                .await?;
            print_payee("Counterparty payee", info.relayer, info.payee);
        }

        Commands::Channels => {
            let channels = api.fee_channels().await?;
            if channels.is_empty() {
                println!("No fee-enabled channels.");
            }
            for channel in channels {
                println!("{}/{}", channel.port_id, channel.channel_id);
            }
        }

        Commands::Balance { address } => {
            let info = api.balance(&address).await?;
            println!("Address: {}", info.address);
            if info.balances.is_empty() {
                println!("Balance: 0");
            }
            for coin in info.balances {
                println!("Balance: {}", coin);
            }
        }

        Commands::Status => {
            let status = api.status().await?;
            println!("{}", "relayfee Node Status".bold());
            println!("========================");
            println!("Node:             {}", status.node_name);
            println!("Chain ID:         {}", status.chain_id);
            println!("State Version:    {}", status.state_version);
            println!("State Root:       {}", truncate(&status.state_root, 16));
            println!("Fee Denom:        {}", status.fee_denom);
            println!(
                "Escrow:           {} {} ({})",
                status.escrow_balance, status.fee_denom, status.escrow_account
            );
            println!(
                "Fee Module:       {}",
                if status.fee_locked {
                    "LOCKED".red().bold()
                } else {
                    "active".green()
                }
            );
            println!("Channels:         {} ({} fee-enabled)", status.channels, status.fee_enabled_channels);
            println!("Incentivized:     {}", status.incentivized_packets);
        }
    }

    Ok(())
}

fn print_receipt(receipt: &FeeReceipt) {
    if receipt.queued {
        println!("{}", "✅ Fee queued until the packet is sent".green());
    } else {
        println!("{}", "✅ Fee escrowed".green());
    }
    println!("Packet: {}", receipt.packet_id);
    println!("Fee:    {}", receipt.packet_fee.fee);
    println!("Payer:  {}", receipt.packet_fee.refund_address);
}

fn print_packet_row(packet: &IncentivizedPacket) {
    let fee = &packet.total_fee;
    println!(
        "{:<36} {:>10} {:>10} {:>10} {:>8}",
        packet.packet_id.to_string(),
        fee.recv_fee.to_string(),
        fee.ack_fee.to_string(),
        fee.timeout_fee.to_string(),
        packet.packet_fees.len()
    );
}

fn print_record(index: usize, record: &PacketFee, queued: bool) {
    let label = if queued { "queued" } else { "record" };
    println!("  {} #{}: {} from {}", label, index, record.fee, record.refund_address);
    if !record.relayers.is_empty() {
        let relayers: Vec<String> = record.relayers.iter().map(|r| r.to_string()).collect();
        println!("    relayers: {}", relayers.join(", "));
    }
}

fn print_payee(label: &str, relayer: Address, payee: Option<Address>) {
    println!("Relayer: {}", relayer);
    match payee {
        Some(payee) => println!("{}: {}", label, payee),
        None => println!("{}: {} (paid directly)", label, "not registered".yellow()),
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else {
        format!("{}...", &s[..max_len])
    }
}
