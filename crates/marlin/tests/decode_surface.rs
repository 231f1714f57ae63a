//! Decode behavior through the public API: synthetic column definitions,
//! hand-framed row payloads, and the typed getters.

use std::sync::Arc;

use marlin::client::Row;
use marlin::message::server::ColumnDefinition;
use marlin::protocol::PacketWriter;
use marlin::{DataType, Date, DateTime, Error, Time};

fn columns(specs: &[(&str, DataType)]) -> Arc<[ColumnDefinition]> {
    Arc::from(
        specs
            .iter()
            .map(|(name, ty)| ColumnDefinition::synthetic(name, *ty))
            .collect::<Vec<_>>(),
    )
}

fn text_row(columns: &Arc<[ColumnDefinition]>, cells: &[Option<&str>]) -> Row {
    let mut w = PacketWriter::new();
    for cell in cells {
        match cell {
            Some(s) => w.write_lenenc_str(s),
            None => w.write_u8(0xFB),
        }
    }
    Row::parse_text(columns.clone(), w.into_bytes()).unwrap()
}

#[test]
fn datetime_column_scenario() {
    let cols = columns(&[("t1", DataType::DateTime)]);

    let row = text_row(&cols, &[Some("2010-01-12 01:55:12")]);
    let ts: DateTime = row.get(0).unwrap();
    assert_eq!(ts.unix_timestamp_micros() / 1000, 1_263_261_312_000);

    let date: Date = row.get(0).unwrap();
    assert_eq!(date.unix_timestamp() * 1000, 1_263_254_400_000);

    let duration: std::time::Duration = row.get(0).unwrap();
    assert_eq!(
        duration,
        std::time::Duration::from_secs(265 * 3600 + 55 * 60 + 12)
    );

    let err = row.get::<marlin::codec::numeric::Decimal>(0).unwrap_err();
    assert_eq!(
        err.to_string(),
        "Data type DATETIME cannot be decoded as Decimal"
    );

    let row = text_row(&cols, &[Some("1000-01-01 01:55:13.2")]);
    let ts: DateTime = row.get(0).unwrap();
    assert_eq!(ts.micros, 200_000);

    let row = text_row(&cols, &[Some("9999-12-31 18:30:12.55")]);
    let ts: DateTime = row.get(0).unwrap();
    assert_eq!((ts.hour, ts.minute, ts.second, ts.micros), (18, 30, 12, 550_000));

    let row = text_row(&cols, &[None]);
    assert!(row.get_opt::<DateTime>(0).unwrap().is_none());
}

#[test]
fn float_column_scenario() {
    let cols = columns(&[
        ("t1", DataType::Float),
        ("t2", DataType::Float),
        ("t3", DataType::Float),
        ("t4", DataType::Float),
    ]);
    let row = text_row(&cols, &[Some("0"), Some("105.21"), Some("-1.6"), None]);

    assert_eq!(row.get::<i8>(0).unwrap(), 0);
    assert_eq!(row.get::<i16>(0).unwrap(), 0);
    assert_eq!(row.get::<i32>(0).unwrap(), 0);
    assert_eq!(row.get::<i64>(0).unwrap(), 0);
    assert_eq!(row.get::<f32>(0).unwrap(), 0.0);
    assert_eq!(row.get::<f64>(0).unwrap(), 0.0);

    assert_eq!(row.get::<i8>(1).unwrap(), 105);
    assert_eq!(row.get::<i64>(1).unwrap(), 105);
    assert_eq!(row.get::<i32>(2).unwrap(), -1);

    assert!(row.is_null(3).unwrap());
    assert!(row.get_opt::<f32>(3).unwrap().is_none());

    for target_err in [
        row.get::<Date>(1).unwrap_err(),
        row.get::<Time>(1).unwrap_err(),
        row.get::<DateTime>(1).unwrap_err(),
    ] {
        assert!(target_err
            .to_string()
            .starts_with("Data type FLOAT cannot be decoded as "));
    }
}

#[test]
fn rejection_messages_name_server_types() {
    let cols = columns(&[("b", DataType::Blob)]);
    let row = text_row(&cols, &[Some("123")]);
    let err = row.get::<i32>(0).unwrap_err();
    assert_eq!(err.to_string(), "Data type BLOB cannot be decoded as Integer");
    assert_eq!(err.sql_state(), "22018");
}

#[test]
fn usage_errors_are_distinct_from_decode_errors() {
    let cols = columns(&[("a", DataType::Int)]);
    let row = text_row(&cols, &[Some("1")]);

    let bounds = row.get::<i32>(9).unwrap_err();
    assert!(matches!(bounds, Error::Usage(_)));

    let label = row.get_by_name::<i32>("nope").unwrap_err();
    assert!(matches!(label, Error::Usage(_)));

    let decode = row.get::<Date>(0).unwrap_err();
    assert!(matches!(decode, Error::Decode(_)));
}
