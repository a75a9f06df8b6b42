//! # Seed Data Generator
//!
//! Fills a database with a register day so the sync worker has something to
//! replay.
//!
//! ## Usage
//! ```bash
//! # One batch with 20 orders, closed at the end (default)
//! cargo run -p cashline-db --bin seed
//!
//! # More orders, leave the batch open
//! cargo run -p cashline-db --bin seed -- --orders 200 --keep-open
//!
//! # Specify database path
//! cargo run -p cashline-db --bin seed -- --db ./data/cashline.db
//! ```
//!
//! ## Generated Queue
//! ```text
//! open_batch
//! create_order × N        (every 7th order paid by card)
//! create_refund           (every 10th order gets a partial refund)
//! close_batch             (unless --keep-open)
//! ```

use cashline_core::{Batch, Order, OrderItem, PaymentMethod, Refund};
use cashline_db::{Database, DbConfig};
use std::env;

/// Products rung up by the generator: (product id, sku, name, price cents, tax bps)
const CATALOG: &[(&str, &str, &str, i64, i64)] = &[
    ("p-001", "BEV-COLA-330", "Cola 330ml", 150, 825),
    ("p-002", "BEV-WATR-500", "Still Water 500ml", 99, 0),
    ("p-003", "SNK-CHIP-150", "Salted Chips 150g", 275, 825),
    ("p-004", "DRY-MILK-1L", "Whole Milk 1L", 189, 0),
    ("p-005", "BAK-SOUR-800", "Sourdough Loaf", 450, 0),
    ("p-006", "FRZ-PIZZ-400", "Frozen Pizza", 599, 825),
    ("p-007", "SNK-CHOC-045", "Milk Chocolate Bar", 129, 825),
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut order_count: usize = 20;
    let mut db_path = String::from("./cashline_dev.db");
    let mut keep_open = false;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--orders" | "-n" => {
                if i + 1 < args.len() {
                    order_count = args[i + 1].parse().unwrap_or(20);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--keep-open" => keep_open = true,
            "--help" | "-h" => {
                println!("Cashline Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -n, --orders <N>   Number of orders to ring up (default: 20)");
                println!("  -d, --db <PATH>    Database file path (default: ./cashline_dev.db)");
                println!("      --keep-open    Do not close the batch at the end");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("🌱 Cashline Seed Data Generator");
    println!("===============================");
    println!("Database: {}", db_path);
    println!("Orders:   {}", order_count);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;

    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = db.commands().stats().await?;
    if existing.outstanding() > 0 {
        println!("⚠ Queue already has {} unsynced commands", existing.outstanding());
        println!("  Skipping seed so the demo day is not interleaved.");
        return Ok(());
    }

    let start = std::time::Instant::now();
    let outbox = db.outbox();

    let batch = Batch::open("store-001", "cashier-042", "front-of-house", "register-01", 20_000);
    outbox.record_batch_opened(&batch).await?;
    println!("✓ Opened batch {}", batch.id);

    let day = batch.opened_at.format("%Y%m%d");
    let mut cash_taken: i64 = 0;
    let mut refunds = 0;

    for n in 0..order_count {
        let (order, items) = generate_order(&batch.id, &format!("R-{}-{:04}", day, n + 1), n);

        if let Err(e) = outbox.record_order(&order, &items).await {
            eprintln!("Failed to record {}: {}", order.receipt_number, e);
            continue;
        }
        if order.payment_method == PaymentMethod::Cash {
            cash_taken += order.total_cents;
        }

        if n % 10 == 9 {
            let amount = (order.total_cents / 2).max(1);
            let refund = Refund::new(&order.id, amount, Some("customer return".to_string()));
            outbox.record_refund(&refund).await?;
            if order.payment_method == PaymentMethod::Cash {
                cash_taken -= amount;
            }
            refunds += 1;
        }
    }

    println!("✓ Recorded {} orders, {} refunds", order_count, refunds);

    if !keep_open {
        outbox
            .record_batch_closed(&batch.id, batch.starting_cash_cents + cash_taken)
            .await?;
        println!(
            "✓ Closed batch with ${:.2} in the drawer",
            (batch.starting_cash_cents + cash_taken) as f64 / 100.0
        );
    }

    let stats = db.commands().stats().await?;
    println!();
    println!("✓ Seed complete in {:?}", start.elapsed());
    println!("  Pending commands: {}", stats.pending);

    Ok(())
}

/// Builds one order with 1-3 lines picked from the catalog.
fn generate_order(batch_id: &str, receipt: &str, seed: usize) -> (Order, Vec<OrderItem>) {
    let payment = if seed % 7 == 6 {
        PaymentMethod::ExternalCard
    } else {
        PaymentMethod::Cash
    };
    let mut order = Order::new(batch_id, receipt, payment);

    let lines = 1 + seed % 3;
    let items: Vec<OrderItem> = (0..lines)
        .map(|l| {
            let (product_id, sku, name, price, tax_bps) = CATALOG[(seed * 3 + l) % CATALOG.len()];
            let quantity = 1 + ((seed + l) % 2) as i64;
            let tax = price * quantity * tax_bps / 10_000;
            OrderItem::new(&order.id, product_id, sku, name, price, quantity, tax)
        })
        .collect();

    order.apply_items(&items);
    (order, items)
}
