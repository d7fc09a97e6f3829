//! Arrow schema for recorded rows and row-to-batch conversion.
//!
//! Prices and quantities are stored as `Float64`; full decimal
//! precision lives only inside the engine. Level lists keep
//! top-of-book-first ordering so `bid_prices[0]` is always the best bid.

use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanBuilder, Float64Builder, ListBuilder, StringBuilder,
    TimestampMicrosecondBuilder, UInt64Builder,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::book::RecordedRow;
use crate::domain::StorageError;

fn level_list_field(name: &str) -> Field {
    Field::new(
        name,
        DataType::List(Arc::new(Field::new("item", DataType::Float64, true))),
        false,
    )
}

pub fn row_schema() -> Arc<Schema> {
    Arc::new(Schema::new(vec![
        Field::new(
            "timestamp",
            DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into())),
            false,
        ),
        Field::new("sequence_id", DataType::UInt64, false),
        Field::new("venue", DataType::Utf8, false),
        Field::new("instrument", DataType::Utf8, false),
        Field::new("event_type", DataType::Utf8, false),
        Field::new("crossed", DataType::Boolean, false),
        level_list_field("bid_prices"),
        level_list_field("bid_quantities"),
        level_list_field("ask_prices"),
        level_list_field("ask_quantities"),
        Field::new("best_bid", DataType::Float64, true),
        Field::new("best_ask", DataType::Float64, true),
        Field::new("best_bid_size", DataType::Float64, true),
        Field::new("best_ask_size", DataType::Float64, true),
        Field::new("spread", DataType::Float64, true),
        Field::new("spread_percent", DataType::Float64, true),
        Field::new("mid_price", DataType::Float64, true),
        Field::new("total_bid_volume", DataType::Float64, false),
        Field::new("total_ask_volume", DataType::Float64, false),
    ]))
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or_default()
}

/// Convert a slice of rows into one Arrow record batch.
pub fn rows_to_batch(rows: &[RecordedRow]) -> Result<RecordBatch, StorageError> {
    let mut ts = TimestampMicrosecondBuilder::with_capacity(rows.len()).with_timezone("UTC");
    let mut sequence_id = UInt64Builder::with_capacity(rows.len());
    let mut venue = StringBuilder::new();
    let mut instrument = StringBuilder::new();
    let mut event_type = StringBuilder::new();
    let mut crossed = BooleanBuilder::with_capacity(rows.len());
    let mut bid_prices = ListBuilder::new(Float64Builder::new());
    let mut bid_quantities = ListBuilder::new(Float64Builder::new());
    let mut ask_prices = ListBuilder::new(Float64Builder::new());
    let mut ask_quantities = ListBuilder::new(Float64Builder::new());
    let mut best_bid = Float64Builder::with_capacity(rows.len());
    let mut best_ask = Float64Builder::with_capacity(rows.len());
    let mut best_bid_size = Float64Builder::with_capacity(rows.len());
    let mut best_ask_size = Float64Builder::with_capacity(rows.len());
    let mut spread = Float64Builder::with_capacity(rows.len());
    let mut spread_percent = Float64Builder::with_capacity(rows.len());
    let mut mid_price = Float64Builder::with_capacity(rows.len());
    let mut total_bid_volume = Float64Builder::with_capacity(rows.len());
    let mut total_ask_volume = Float64Builder::with_capacity(rows.len());

    for row in rows {
        ts.append_value(row.ts.timestamp_micros());
        sequence_id.append_value(row.sequence_id);
        venue.append_value(row.venue.as_str());
        instrument.append_value(&row.instrument);
        event_type.append_value(row.event_type.as_str());
        crossed.append_value(row.crossed);

        for l in &row.bids {
            bid_prices.values().append_value(to_f64(l.price));
            bid_quantities.values().append_value(to_f64(l.quantity));
        }
        bid_prices.append(true);
        bid_quantities.append(true);
        for l in &row.asks {
            ask_prices.values().append_value(to_f64(l.price));
            ask_quantities.values().append_value(to_f64(l.quantity));
        }
        ask_prices.append(true);
        ask_quantities.append(true);

        best_bid.append_option(row.best_bid.map(to_f64));
        best_ask.append_option(row.best_ask.map(to_f64));
        best_bid_size.append_option(row.best_bid_size.map(to_f64));
        best_ask_size.append_option(row.best_ask_size.map(to_f64));
        spread.append_option(row.spread.map(to_f64));
        spread_percent.append_option(row.spread_percent.map(to_f64));
        mid_price.append_option(row.mid_price.map(to_f64));
        total_bid_volume.append_value(to_f64(row.total_bid_volume));
        total_ask_volume.append_value(to_f64(row.total_ask_volume));
    }

    let columns: Vec<ArrayRef> = vec![
        Arc::new(ts.finish()),
        Arc::new(sequence_id.finish()),
        Arc::new(venue.finish()),
        Arc::new(instrument.finish()),
        Arc::new(event_type.finish()),
        Arc::new(crossed.finish()),
        Arc::new(bid_prices.finish()),
        Arc::new(bid_quantities.finish()),
        Arc::new(ask_prices.finish()),
        Arc::new(ask_quantities.finish()),
        Arc::new(best_bid.finish()),
        Arc::new(best_ask.finish()),
        Arc::new(best_bid_size.finish()),
        Arc::new(best_ask_size.finish()),
        Arc::new(spread.finish()),
        Arc::new(spread_percent.finish()),
        Arc::new(mid_price.finish()),
        Arc::new(total_bid_volume.finish()),
        Arc::new(total_ask_volume.finish()),
    ];

    Ok(RecordBatch::try_new(row_schema(), columns)?)
}
