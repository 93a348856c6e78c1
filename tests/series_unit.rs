//! Columnar conversion edge cases through the public API.

use std::collections::HashMap;

use tickstream::{Column, ColumnSeries, ColumnSeriesMap, DataSet, SeriesError, SeriesKey};

#[test]
fn every_column_type_round_trips() {
    let series = ColumnSeries::new()
        .add_column("a", Column::I32(vec![-1, 0, 1]))
        .add_column("b", Column::I64(vec![i64::MIN, 0, i64::MAX]))
        .add_column("c", Column::F32(vec![0.5, -0.5, 3.25]))
        .add_column("d", Column::F64(vec![1e-9, 2.0, -7.125]))
        .add_column("e", Column::U8(vec![0, 128, 255]));

    let key = SeriesKey::new("XYZ/1Sec/TICK");
    let ds = DataSet::from_column_series(&key, &series);
    let back = ds.to_column_series(0, 3).expect("unpack");
    assert_eq!(back, series);
}

#[test]
fn empty_series_is_representable() {
    let key = SeriesKey::new("XYZ/1Min/OHLCV");
    let ds = DataSet::from_column_series(&key, &ColumnSeries::new());
    assert_eq!(ds.length, 0);
    let back = ds.to_column_series(0, 0).expect("unpack");
    assert!(back.is_empty());
}

#[test]
fn merge_requires_a_length_per_indexed_key() {
    let key = SeriesKey::new("XYZ/1Min/OHLCV");
    let series = ColumnSeries::new().add_column("Epoch", Column::I64(vec![1, 2]));
    let mut ds = DataSet::from_column_series(&key, &series);
    ds.lengths = HashMap::new();

    let mut out = ColumnSeriesMap::new();
    let err = ds.merge_into(&mut out).expect_err("length map is empty");
    assert!(matches!(err, SeriesError::MissingLength(_)), "{:?}", err);
}

#[test]
fn mismatched_shape_is_rejected() {
    let key = SeriesKey::new("XYZ/1Min/OHLCV");
    let series = ColumnSeries::new().add_column("Epoch", Column::I64(vec![1, 2]));
    let mut ds = DataSet::from_column_series(&key, &series);
    ds.column_names.push("Orphan".to_string());

    assert!(matches!(
        ds.to_column_series(0, 2),
        Err(SeriesError::Shape { .. })
    ));
}
