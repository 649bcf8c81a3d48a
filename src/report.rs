use anyhow::{Context, Result, bail};
use chrono::NaiveDate;

use crate::model::Allocation;

/// Render one day's allocation as CSV: `date,ticker,percent` with one row
/// per ticker. Percents use the shortest round-trippable float form, so
/// `parse_allocation_csv(format_allocation_csv(d, a)) == (d, a)`.
pub fn format_allocation_csv(date: NaiveDate, allocation: &Allocation) -> String {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(["date", "ticker", "percent"])
        .expect("csv header");

    for (ticker, percent) in allocation {
        writer
            .write_record([date.to_string(), ticker.clone(), format!("{percent}")])
            .expect("csv row");
    }

    let bytes = writer.into_inner().expect("csv flush");
    String::from_utf8(bytes).expect("csv utf8")
}

pub fn parse_allocation_csv(input: &str) -> Result<(NaiveDate, Allocation)> {
    let mut reader = csv::Reader::from_reader(input.as_bytes());
    let mut date: Option<NaiveDate> = None;
    let mut allocation = Allocation::new();

    for record in reader.records() {
        let record = record.context("reading csv record")?;
        if record.len() != 3 {
            bail!("expected 3 columns, got {}", record.len());
        }

        let row_date: NaiveDate = record[0].parse().context("parsing date column")?;
        match date {
            None => date = Some(row_date),
            Some(d) if d != row_date => bail!("mixed dates in allocation csv"),
            Some(_) => {}
        }

        let ticker = record[1].to_string();
        let percent: f64 = record[2].parse().context("parsing percent column")?;
        if percent < 0.0 {
            bail!("negative percent for {ticker}");
        }
        allocation.insert(ticker, percent);
    }

    let date = date.context("allocation csv has no rows")?;
    Ok((date, allocation))
}
