use power_monitor::{sink_for_path, MetricsHub, MonitorConfig, RecordSink, SampleRecord};
use std::fs;

fn record(ts: f64) -> SampleRecord {
    let mut rec = SampleRecord::new(ts);
    rec.adc_channels[0] = Some(3.3);
    rec.bus_voltage_v = Some(12.0);
    rec.current_a = Some(-0.25);
    rec.power_w = Some(3.0);
    rec
}

#[test]
fn config_round_trips_through_yaml_and_json() {
    let dir = tempfile::tempdir().unwrap();
    let defaults = MonitorConfig::defaults();
    for name in ["monitor.yaml", "monitor.json"] {
        let path = dir.path().join(name);
        defaults.save(&path).unwrap();
        let back = MonitorConfig::load(&path).unwrap();
        assert_eq!(back, defaults, "{name}");
    }
}

#[test]
fn invalid_config_file_fails_with_path_context() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bad.yaml");
    fs::write(
        &path,
        "adc128d818:\n  i2c: {bus: 1, address: 29}\n  config:\n    mode: 7\n",
    )
    .unwrap();
    let err = MonitorConfig::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("bad.yaml"));

    assert!(MonitorConfig::load(dir.path().join("missing.yaml")).is_err());
}

#[test]
fn csv_file_sink() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.csv");
    let hub = MetricsHub::new().unwrap();
    {
        let mut sink = sink_for_path(&path, &hub).unwrap();
        sink.write(&record(1.0)).unwrap();
        sink.write(&record(2.0)).unwrap();
        sink.flush().unwrap();
    }
    let text = fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("timestamp,ch0,"));
    assert_eq!(lines[2], "2.000,3.3,,,,,,,,12,-0.25,3");
}

#[test]
fn json_lines_file_sink() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.jsonl");
    let hub = MetricsHub::new().unwrap();
    {
        let mut sink = sink_for_path(&path, &hub).unwrap();
        sink.write(&record(5.5)).unwrap();
    }
    let text = fs::read_to_string(&path).unwrap();
    let rec: SampleRecord = serde_json::from_str(text.trim()).unwrap();
    assert_eq!(rec, record(5.5));
}

#[test]
fn prom_file_is_replaced_each_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pmon.prom");
    let hub = MetricsHub::new().unwrap();
    let mut sink = sink_for_path(&path, &hub).unwrap();

    hub.observe(&record(10.0));
    sink.write(&record(10.0)).unwrap();
    let first = fs::read_to_string(&path).unwrap();
    assert!(first.contains("pmon_sample_timestamp_seconds 10"));
    assert!(first.contains("pmon_bus_voltage_volts 12"));

    hub.observe(&record(11.0));
    sink.write(&record(11.0)).unwrap();
    let second = fs::read_to_string(&path).unwrap();
    assert!(second.contains("pmon_sample_timestamp_seconds 11"));
    assert!(second.contains("pmon_samples_total 2"));
    assert!(!dir.path().join("pmon.prom.tmp").exists());
}

#[test]
fn older_tool_config_file_loads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pmon_config.json");
    fs::write(
        &path,
        r#"{
  "UDP_Addr": "localhost",
  "UDP_Port": 8888,
  "Read_Interval": 2.5,
  "ADC128D818_I2C": {"bus": 1, "address": 29},
  "ADC128D818_config": {
    "start": true,
    "continuous": true,
    "disable_mask": 255,
    "mode": 1,
    "extResistorMultipliers": [2.0, 2.0, 2.0, 5.0, 5.0, 5.0, 2.0, 100.0]
  },
  "INA260_I2C": {"bus": 1, "address": 64},
  "INA260_config": {"config_reg": 4660}
}"#,
    )
    .unwrap();
    let cfg = MonitorConfig::load(&path).unwrap();
    assert_eq!(cfg.udp.as_ref().unwrap().port, 8888);
    assert_eq!(cfg.read_interval_s, 2.5);
    assert_eq!(cfg.adc128d818.as_ref().unwrap().config.disable_mask, 0xFF);
    assert_eq!(cfg.ina260.as_ref().unwrap().i2c.address, 0x40);

    // Saving writes the current layout, which loads back unchanged
    let resaved = dir.path().join("resaved.yaml");
    cfg.save(&resaved).unwrap();
    assert_eq!(MonitorConfig::load(&resaved).unwrap(), cfg);
}
