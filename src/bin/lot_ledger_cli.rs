use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use lot_ledger::{
    clock::{Clock, SystemClock},
    config::{self, AppConfig},
    db,
    entities::lot,
    errors::ServiceError,
    events::{Event, EventSender},
    services::{EngineSettings, InventoryServices},
    store::{LedgerStore, MovementQuery, SeaOrmStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let context = CliContext::initialize(cli.migrate).await?;

    let json = cli.json;
    if let Err(err) = run(&context, cli.command, json).await {
        // Engine failures render as the stable error payload in JSON mode
        if let Some(service_error) = err.downcast_ref::<ServiceError>().filter(|_| json) {
            print_json(&service_error.to_response())?;
            std::process::exit(1);
        }
        return Err(err);
    }
    Ok(())
}

async fn run(context: &CliContext, command: Commands, json: bool) -> Result<()> {
    match command {
        Commands::Availability(args) => handle_availability(context, args, json).await,
        Commands::Plan(args) => handle_plan(context, args, json).await,
        Commands::Lot(command) => handle_lot_command(context, command, json).await,
        Commands::Movements(args) => handle_movements(context, args, json).await,
        Commands::Reservation(command) => handle_reservation_command(context, command, json).await,
        Commands::Sweep => handle_sweep(context, json).await,
    }
}

#[derive(Parser)]
#[command(name = "lot-ledger", about = "Inspect and operate the lot-tracked inventory ledger", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Apply pending migrations before running the command"
    )]
    migrate: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Eligible on-hand, reserved and available totals for a material
    Availability(QuantityArgs),
    /// FEFO allocation plan without side effects
    Plan(QuantityArgs),
    #[command(subcommand)]
    Lot(LotCommands),
    /// Movement history, newest first
    Movements(MovementArgs),
    #[command(subcommand)]
    Reservation(ReservationCommands),
    /// Run the lot and reservation expiry sweeps once
    Sweep,
}

#[derive(Args)]
struct QuantityArgs {
    #[arg(long)]
    material: Uuid,
    #[arg(long)]
    quantity: Decimal,
    #[arg(long)]
    warehouse: Option<Uuid>,
}

#[derive(Subcommand)]
enum LotCommands {
    /// Show a lot by id or lot number
    Show { lot: String },
    /// Available lots expiring within the given number of days
    Expiring {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },
    /// Release a lot through QC
    Pass {
        lot: String,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Reject a lot at QC
    Fail {
        lot: String,
        #[arg(long)]
        reason: String,
    },
    Block {
        lot: String,
        #[arg(long)]
        reason: String,
    },
    Unblock { lot: String },
}

#[derive(Args)]
struct MovementArgs {
    #[arg(long, conflicts_with = "lot", required_unless_present = "lot")]
    material: Option<Uuid>,
    #[arg(long)]
    lot: Option<String>,
    #[arg(long, default_value_t = 50)]
    limit: u64,
}

#[derive(Subcommand)]
enum ReservationCommands {
    Show { id: Uuid },
    Release { id: Uuid },
}

struct CliContext {
    services: InventoryServices,
}

impl CliContext {
    async fn initialize(migrate: bool) -> Result<Self> {
        let config: AppConfig = config::load_config().context("failed to load application config")?;
        config::init_tracing(config.log_level(), config.log_json);

        let db_pool = db::establish_connection_from_app_config(&config)
            .await
            .context("failed to connect to database")?;
        if migrate || config.auto_migrate {
            db::run_migrations(&db_pool)
                .await
                .context("failed to run migrations")?;
        }

        let (event_tx, mut event_rx) = mpsc::channel::<Event>(32);
        tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                debug!(target: "lot_ledger_cli", event = ?event, "received event");
            }
        });

        let store: Arc<dyn LedgerStore> = Arc::new(SeaOrmStore::new(Arc::new(db_pool)));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let services = InventoryServices::new(
            store,
            clock,
            EventSender::new(event_tx),
            EngineSettings::from(&config),
        );
        Ok(Self { services })
    }

    /// Accepts either a lot id or a lot number.
    async fn resolve_lot(&self, reference: &str) -> Result<lot::Model> {
        let found = match Uuid::from_str(reference) {
            Ok(id) => self.services.lots.get_lot(id).await,
            Err(_) => self.services.lots.find_by_number(reference).await,
        };
        found.with_context(|| format!("lot {} not found", reference))
    }
}

async fn handle_availability(context: &CliContext, args: QuantityArgs, json: bool) -> Result<()> {
    let availability = context
        .services
        .stock
        .check_availability(args.material, args.quantity, args.warehouse)
        .await
        .context("availability check failed")?;

    if json {
        return print_json(&availability);
    }
    println!(
        "Material {}: total {} • reserved {} • available {}",
        availability.material_id,
        availability.total_qty,
        availability.reserved_qty,
        availability.available_qty
    );
    if availability.is_available {
        println!("Requested {} is available", availability.requested_qty);
    } else {
        println!(
            "Requested {} is short by {}",
            availability.requested_qty, availability.shortage_qty
        );
    }
    Ok(())
}

async fn handle_plan(context: &CliContext, args: QuantityArgs, json: bool) -> Result<()> {
    let plan = context
        .services
        .stock
        .plan_allocation(args.material, args.quantity, args.warehouse)
        .await
        .context("allocation planning failed")?;

    if json {
        return print_json(&plan);
    }
    for allocation in &plan.allocations {
        println!(
            "- {} (expires {}) at {} • {}",
            allocation.lot_number, allocation.expiry_date, allocation.location_id, allocation.quantity
        );
    }
    if plan.is_complete() {
        println!("Fully allocated");
    } else {
        println!("Unfulfilled: {}", plan.remaining_unfulfilled);
    }
    Ok(())
}

async fn handle_lot_command(context: &CliContext, command: LotCommands, json: bool) -> Result<()> {
    let lots = &context.services.lots;
    match command {
        LotCommands::Show { lot } => {
            let lot = context.resolve_lot(&lot).await?;
            render_lot_or_json(&lot, json)
        }
        LotCommands::Expiring { days } => {
            let expiring = lots.expiring_lots(days).await.context("failed to list lots")?;
            if json {
                return print_json(&expiring);
            }
            if expiring.is_empty() {
                println!("No lots expire within {} days", days);
            }
            expiring.iter().for_each(render_lot);
            Ok(())
        }
        LotCommands::Pass { lot, notes } => {
            let lot = context.resolve_lot(&lot).await?;
            let lot = lots.pass_qc(lot.id, notes).await.context("QC pass failed")?;
            render_lot_or_json(&lot, json)
        }
        LotCommands::Fail { lot, reason } => {
            let lot = context.resolve_lot(&lot).await?;
            let lot = lots.fail_qc(lot.id, reason).await.context("QC fail failed")?;
            render_lot_or_json(&lot, json)
        }
        LotCommands::Block { lot, reason } => {
            let lot = context.resolve_lot(&lot).await?;
            let lot = lots.block_lot(lot.id, reason).await.context("block failed")?;
            render_lot_or_json(&lot, json)
        }
        LotCommands::Unblock { lot } => {
            let lot = context.resolve_lot(&lot).await?;
            let lot = lots.unblock_lot(lot.id).await.context("unblock failed")?;
            render_lot_or_json(&lot, json)
        }
    }
}

async fn handle_movements(context: &CliContext, args: MovementArgs, json: bool) -> Result<()> {
    let query = match (args.material, args.lot) {
        (_, Some(lot)) => MovementQuery::for_lot(context.resolve_lot(&lot).await?.id),
        (Some(material), None) => MovementQuery::for_material(material),
        (None, None) => anyhow::bail!("either --material or --lot is required"),
    }
    .with_limit(args.limit);

    let movements = context
        .services
        .movements
        .movements(query)
        .await
        .context("failed to load movements")?;

    if json {
        return print_json(&movements);
    }
    for movement in &movements {
        println!(
            "- {} {} {} {} • {} {}",
            movement.created_at.format("%Y-%m-%d %H:%M"),
            movement.movement_number,
            movement.movement_type,
            movement.reference_type,
            movement.quantity,
            movement.unit_of_measure
        );
    }
    Ok(())
}

async fn handle_reservation_command(
    context: &CliContext,
    command: ReservationCommands,
    json: bool,
) -> Result<()> {
    let reservations = &context.services.reservations;
    let details = match command {
        ReservationCommands::Show { id } => reservations
            .get_reservation(id)
            .await
            .context("failed to load reservation")?,
        ReservationCommands::Release { id } => reservations
            .release_reservation(id)
            .await
            .context("failed to release reservation")?,
    };

    if json {
        return print_json(&details);
    }
    let reservation = &details.reservation;
    println!(
        "Reservation {} • {} {} of {} • {}",
        reservation.id,
        reservation.quantity,
        reservation.unit_of_measure,
        reservation.material_id,
        reservation.status
    );
    for pin in &details.allocations {
        println!(
            "  - stock {} at {} • {}{}",
            pin.stock_id,
            pin.location_id,
            pin.quantity,
            if pin.consumed { " (issued)" } else { "" }
        );
    }
    Ok(())
}

async fn handle_sweep(context: &CliContext, json: bool) -> Result<()> {
    let sweeper = context.services.expiry_sweeper(
        Arc::new(SystemClock),
        std::time::Duration::from_secs(3600),
        std::time::Duration::from_secs(60),
    );
    let report = sweeper.run_once().await.context("sweep failed")?;
    if json {
        return print_json(&report);
    }
    println!(
        "Expired {} lots, {} expiry alerts, expired {} reservations releasing {}",
        report.lots.expired.len(),
        report.lots.alerts.len(),
        report.reservations.expired.len(),
        report.reservations.released_quantity
    );
    for item in &report.low_stock {
        println!(
            "  low stock: material {} has {} available (threshold {})",
            item.material_id, item.available, item.threshold
        );
    }
    Ok(())
}

fn render_lot_or_json(lot: &lot::Model, json: bool) -> Result<()> {
    if json {
        return print_json(lot);
    }
    render_lot(lot);
    Ok(())
}

fn render_lot(lot: &lot::Model) {
    println!(
        "- {} • material {} • expires {} • QC {} • {}",
        lot.lot_number, lot.material_id, lot.expiry_date, lot.qc_status, lot.status
    );
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
