use chrono::Utc;

use crate::error::ClientError;
use crate::parser::{
    assemble, parse_device_rating, parse_live_metrics, parse_mode, parse_secondary_pv,
    parse_warnings, LIVE_METRICS,
};
use crate::snapshot::RatingInfo;
use crate::test_support::{
    warnings_reply, LIVE_METRICS_REPLY, MODE_REPLY, RATING_REPLY, SECONDARY_PV_REPLY,
};

#[test]
fn live_metrics_decode_positionally() {
    let live = parse_live_metrics(LIVE_METRICS_REPLY).expect("parse");

    assert_eq!(live.grid_voltage, 230.0);
    assert_eq!(live.grid_frequency, 50.0);
    assert_eq!(live.apparent_power, 3000);
    assert_eq!(live.active_power, 2800);
    assert_eq!(live.load_percent, 60);
    assert_eq!(live.bus_voltage, 360.0);
    assert_eq!(live.battery_voltage, 52.4);
    assert_eq!(live.battery_current, 10.2);
    assert_eq!(live.battery_soc, 85);
    assert_eq!(live.battery_temperature, 35);
    assert_eq!(live.pv_current, 12.3);
    assert_eq!(live.pv_voltage, 180.0);
    assert_eq!(live.pv_charge_power, 2000);
}

#[test]
fn short_live_metrics_reply_is_a_parse_error() {
    let result = parse_live_metrics("(230.0 50.0 230.0)");
    assert!(matches!(result, Err(ClientError::Parse(_))));
}

#[test]
fn non_numeric_field_is_a_parse_error() {
    let reply = LIVE_METRICS_REPLY.replace("52.4", "xx.x");
    let err = parse_live_metrics(&reply).unwrap_err();
    assert!(err.to_string().contains("battery_voltage"), "{err}");
}

#[test]
fn schema_lookup_reports_unknown_field_names() {
    let fields = LIVE_METRICS.split(LIVE_METRICS_REPLY).expect("split");
    assert!(fields.float("no_such_field").is_err());
    assert_eq!(fields.text("device_status").expect("text"), "00010110");
}

#[test]
fn secondary_pv_string() {
    let pv2 = parse_secondary_pv(SECONDARY_PV_REPLY).expect("parse");
    assert_eq!(pv2.current, 5.1);
    assert_eq!(pv2.voltage, 210.5);
    assert_eq!(pv2.power, 1073);
}

#[test]
fn mode_codes_map_to_names() {
    assert_eq!(parse_mode(MODE_REPLY), ("L".to_string(), "Line Mode".to_string()));
    assert_eq!(parse_mode("(B)"), ("B".to_string(), "Battery Mode".to_string()));
    assert_eq!(parse_mode("(X"), ("X".to_string(), "Unknown (X)".to_string()));
}

#[test]
fn device_rating_uses_units_and_enum_labels() {
    let RatingInfo::Table(table) = parse_device_rating(RATING_REPLY) else {
        panic!("expected a rating table");
    };

    assert_eq!(table.len(), 27);
    assert_eq!(table["Grid Rating Voltage"], "230.0 V");
    assert_eq!(table["AC Output Rating Apparent Power"], "8000 VA");
    assert_eq!(table["Battery Type"], "User");
    assert_eq!(table["Input Voltage Range"], "Appliance");
    assert_eq!(table["Output Source Priority"], "SolarBatUtility");
    assert_eq!(table["Charger Source Priority"], "Only solar charging permitted");
    assert_eq!(table["Machine Type"], "Off Grid");
    assert_eq!(table["Topology"], "transformerless");
    assert_eq!(table["Output Mode"], "single machine output");
    assert_eq!(table["Max Charging Time at CV Stage"], "480 min");
    assert_eq!(table["Parallel Max Num"], "9");
}

#[test]
fn device_rating_keeps_unknown_enum_codes() {
    let reply = RATING_REPLY.replacen(" 2 30 120 ", " 7 30 120 ", 1);
    let RatingInfo::Table(table) = parse_device_rating(&reply) else {
        panic!("expected a rating table");
    };
    assert_eq!(table["Battery Type"], "7");
}

#[test]
fn short_device_rating_is_an_invalid_marker() {
    assert_eq!(
        parse_device_rating("(230.0 34.7 230.0)"),
        RatingInfo::Invalid {
            reason: "Invalid QPIRI response".to_string()
        }
    );
}

#[test]
fn warnings_bit_one_is_inverter_fault() {
    assert_eq!(parse_warnings(&warnings_reply(&[1])), vec!["Inverter fault"]);
}

#[test]
fn no_set_bits_is_an_explicit_marker() {
    assert_eq!(parse_warnings(&warnings_reply(&[])), vec!["No warnings"]);
}

#[test]
fn warnings_follow_bit_order_and_skip_unmapped_bits() {
    let warnings = parse_warnings(&warnings_reply(&[31, 16, 5, 32]));
    assert_eq!(
        warnings,
        vec!["Line fail", "MPPT overload warning", "Battery too low to charge"]
    );
}

#[test]
fn short_warning_string_is_invalid() {
    assert_eq!(parse_warnings("(0101"), vec!["Invalid QPIWS response"]);
}

#[test]
fn assemble_derives_powers_and_frequencies() {
    // Arrange
    let now = Utc::now();

    // Act
    let parts = assemble(
        LIVE_METRICS_REPLY,
        SECONDARY_PV_REPLY,
        MODE_REPLY,
        RATING_REPLY,
        &warnings_reply(&[1]),
        now,
    )
    .expect("assemble");
    let snapshot = parts.into_snapshot("EASUN_SMW_8K", now).expect("complete");

    // Assert
    assert_eq!(snapshot.battery.voltage, 52.4);
    assert_eq!(snapshot.battery.current, 10.2);
    assert_eq!(snapshot.battery.state_of_charge, 85);
    assert_eq!(snapshot.battery.power, 534);

    assert_eq!(snapshot.grid.frequency, 5000);
    assert_eq!(snapshot.grid.frequency_hz(), 50.0);
    assert_eq!(snapshot.grid.power, 2800);

    assert_eq!(snapshot.output.frequency, 5000);
    assert!((snapshot.output.current - 2800.0 / 230.0).abs() < 1e-9);

    assert_eq!(snapshot.pv.strings.len(), 2);
    assert_eq!(snapshot.pv.strings[0].power, 2214);
    assert_eq!(snapshot.pv.strings[1].power, 1073);
    assert_eq!(snapshot.pv.charging_power, 2000);

    assert_eq!(snapshot.system.mode_name, "Line Mode");
    assert_eq!(snapshot.system.device_time, now);
    assert_eq!(snapshot.system.warnings, Some(vec!["Inverter fault".to_string()]));
    assert!(matches!(snapshot.system.info, Some(RatingInfo::Table(_))));
}

#[test]
fn zero_output_voltage_yields_zero_current() {
    let live = LIVE_METRICS_REPLY.replacen("230.0 50.0 230.0 50.0", "230.0 50.0 0.0 0.0", 1);

    let parts = assemble(
        &live,
        SECONDARY_PV_REPLY,
        MODE_REPLY,
        RATING_REPLY,
        &warnings_reply(&[]),
        Utc::now(),
    )
    .expect("assemble");

    let output = parts.output.expect("output");
    assert_eq!(output.current, 0.0);
    assert_eq!(output.frequency, 0);
}
