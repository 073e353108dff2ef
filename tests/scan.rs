//! End-to-end scans against the in-memory board, through the full bus and
//! protocol stack.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hatscan::calibration::lsb_size;
use hatscan::mock::{MockControl, MockHat};
use hatscan::protocol::{CMD_AIN_SCAN_DATA, CMD_AIN_SCAN_STOP};
use hatscan::{
    BoardSpec, BusLock, CalibrationTable, DeviceInfo, EngineConfig, Hat, HatContext, HatError,
    ScanOptions, ScanStatus,
};

const RAW: ScanOptions = ScanOptions::NO_SCALE_DATA.union(ScanOptions::NO_CALIBRATE_DATA);

fn open(spec: BoardSpec) -> (HatContext, Arc<Hat>, MockControl) {
    let (mock, control) = MockHat::new(spec);
    let config = EngineConfig::default()
        .with_poll_window(Duration::from_micros(100), Duration::from_millis(2))
        .with_read_poll(Duration::from_micros(200));
    let ctx = HatContext::new(BusLock::in_process(mock, Duration::from_secs(1)), config);
    let info = DeviceInfo {
        id: spec.id,
        calibration: CalibrationTable::identity(spec.calibration_entries()),
    };
    let hat = ctx.open(0, info).unwrap();
    (ctx, hat, control)
}

fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

fn available(hat: &Hat) -> usize {
    hat.scan_status().unwrap().samples_available
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * b.abs().max(1.0)
}

#[test]
fn continuous_scan_overruns_once_capacity_is_passed() {
    let (_ctx, hat, control) = open(BoardSpec::MCC118);
    hat.scan_start(0b11, 0, 1000.0, ScanOptions::CONTINUOUS).unwrap();
    assert_eq!(hat.scan_buffer_size().unwrap(), 20_000);
    assert_eq!(hat.scan_channel_count(), 2);

    for step in 1..=4 {
        control.produce(2_500);
        wait_until("buffer to fill", || available(&hat) == 2_500 * step);
        let status = hat.scan_status().unwrap().status;
        assert!(!status.is_overrun(), "overrun after step {step}");
        assert!(status.contains(ScanStatus::RUNNING));
    }

    control.produce(2_500);
    wait_until("buffer overrun", || hat.scan_status().unwrap().status.is_overrun());
    let info = hat.scan_status().unwrap();
    assert!(info.status.contains(ScanStatus::BUFFER_OVERRUN));
    assert!(!info.status.contains(ScanStatus::RUNNING));
    assert_eq!(info.samples_available, 10_000);
    wait_until("device stop", || !control.is_running());

    let mut buf = vec![0.0; 20_000];
    let read = hat.scan_read(-1, 0.0, &mut buf).unwrap();
    assert_eq!(read.samples_per_channel, 10_000);
    assert!(read.status.contains(ScanStatus::BUFFER_OVERRUN));
    hat.scan_cleanup().unwrap();
}

#[test]
fn second_start_is_busy_and_cleanup_is_bounded() {
    let (_ctx, hat, _control) = open(BoardSpec::MCC118);
    hat.scan_start(0b1, 0, 1000.0, ScanOptions::CONTINUOUS).unwrap();
    assert!(matches!(
        hat.scan_start(0b1, 0, 1000.0, ScanOptions::CONTINUOUS),
        Err(HatError::Busy)
    ));

    hat.scan_stop().unwrap();
    let started = Instant::now();
    hat.scan_cleanup().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(hat.scan_channel_count(), 0);

    hat.scan_start(0b1, 0, 1000.0, ScanOptions::CONTINUOUS).unwrap();
    hat.scan_cleanup().unwrap();
}

#[test]
fn read_all_returns_what_is_buffered_without_waiting() {
    let (_ctx, hat, control) = open(BoardSpec::MCC118);
    hat.scan_start(0b11, 0, 1000.0, ScanOptions::CONTINUOUS).unwrap();
    control.produce(100);
    wait_until("data", || available(&hat) == 100);

    let mut buf = vec![0.0; 1_000];
    let started = Instant::now();
    let read = hat.scan_read(-1, 10.0, &mut buf).unwrap();
    assert_eq!(read.samples_per_channel, 100);

    let read = hat.scan_read(-1, 10.0, &mut buf).unwrap();
    assert_eq!(read.samples_per_channel, 0);
    assert!(started.elapsed() < Duration::from_secs(1));
    hat.scan_cleanup().unwrap();
}

#[test]
fn short_read_reports_timeout_with_partial_data() {
    let (_ctx, hat, control) = open(BoardSpec::MCC118);
    hat.scan_start(0b11, 0, 1000.0, ScanOptions::CONTINUOUS | RAW).unwrap();
    control.produce(150);
    wait_until("data", || available(&hat) == 150);

    let mut buf = vec![-1.0; 1_000];
    let read = hat.scan_read(500, 0.05, &mut buf).unwrap();
    assert!(read.timed_out);
    assert_eq!(read.samples_per_channel, 150);
    assert!(read.status.contains(ScanStatus::RUNNING));
    assert_eq!(buf[299], 299.0);
    assert_eq!(buf[300], -1.0);
    assert_eq!(available(&hat), 0);

    let started = Instant::now();
    let read = hat.scan_read(50, 0.0, &mut buf).unwrap();
    assert!(read.timed_out);
    assert_eq!(read.samples_per_channel, 0);
    assert!(started.elapsed() < Duration::from_millis(500));

    let read = hat.scan_read(0, 1.0, &mut buf).unwrap();
    assert!(!read.timed_out);
    assert_eq!(read.samples_per_channel, 0);

    // the stream picks up where the timed-out read left it
    control.produce(150);
    let read = hat.scan_read(150, 5.0, &mut buf).unwrap();
    assert!(!read.timed_out);
    assert_eq!(buf[0], 300.0);
    assert_eq!(buf[299], 599.0);
    hat.scan_cleanup().unwrap();
}

#[test]
fn read_arguments_are_checked() {
    let (_ctx, hat, _control) = open(BoardSpec::MCC118);
    hat.scan_start(0b11, 0, 1000.0, ScanOptions::CONTINUOUS).unwrap();
    let mut buf = vec![0.0; 8];
    assert!(matches!(hat.scan_read(-2, 0.0, &mut buf), Err(HatError::BadParameter(_))));
    assert!(matches!(
        hat.scan_read(1, f64::NAN, &mut buf),
        Err(HatError::BadParameter(_))
    ));
    assert!(matches!(
        hat.scan_read(5, 0.0, &mut buf[..1]),
        Err(HatError::BadParameter(_))
    ));
    hat.scan_cleanup().unwrap();
}

#[test]
fn raw_codes_arrive_in_fifo_order() {
    let (_ctx, hat, control) = open(BoardSpec::MCC118);
    hat.scan_start(0b101, 0, 1000.0, ScanOptions::CONTINUOUS | RAW).unwrap();
    control.produce(400);

    let mut buf = vec![0.0; 800];
    let read = hat.scan_read(400, 5.0, &mut buf).unwrap();
    assert_eq!(read.samples_per_channel, 400);
    for (i, &value) in buf.iter().enumerate() {
        assert_eq!(value, i as f64, "sample {i}");
    }
    hat.scan_cleanup().unwrap();
}

#[test]
fn finite_scan_runs_to_completion() {
    let (_ctx, hat, control) = open(BoardSpec::MCC118);
    control.set_auto_produce(50);
    hat.scan_start(0b11, 1_000, 1000.0, ScanOptions::empty()).unwrap();

    let mut buf = vec![0.0; 2_000];
    let read = hat.scan_read(1_000, 5.0, &mut buf).unwrap();
    assert_eq!(read.samples_per_channel, 1_000);
    assert!(!read.timed_out);

    let lsb = lsb_size(&BoardSpec::MCC118.format, -10.0, 10.0);
    assert!(approx(buf[0], -10.0));
    assert!(approx(buf[1], -10.0 + lsb));

    wait_until("scan end", || {
        !hat.scan_status().unwrap().status.contains(ScanStatus::RUNNING)
    });
    let started = Instant::now();
    let read = hat.scan_read(10, 5.0, &mut buf).unwrap();
    assert_eq!(read.samples_per_channel, 0);
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(!control.is_running());
    hat.scan_cleanup().unwrap();
}

#[test]
fn external_trigger_holds_the_scan() {
    let (_ctx, hat, control) = open(BoardSpec::MCC118);
    hat.scan_start(0b11, 0, 1000.0, ScanOptions::CONTINUOUS | ScanOptions::EXT_TRIGGER)
        .unwrap();

    assert_eq!(control.produce(100), 0);
    thread::sleep(Duration::from_millis(20));
    let status = hat.scan_status().unwrap().status;
    assert!(status.contains(ScanStatus::RUNNING));
    assert!(!status.contains(ScanStatus::TRIGGERED));

    control.fire_trigger();
    control.produce(250);
    wait_until("triggered data", || available(&hat) == 250);
    assert!(hat.scan_status().unwrap().status.contains(ScanStatus::TRIGGERED));
    hat.scan_cleanup().unwrap();
}

#[test]
fn hardware_overrun_ends_the_scan() {
    let (_ctx, hat, control) = open(BoardSpec::MCC118);
    hat.scan_start(0b11, 0, 1000.0, ScanOptions::CONTINUOUS).unwrap();
    control.produce(250);
    wait_until("data", || available(&hat) == 250);

    control.set_hw_overrun();
    wait_until("overrun flag", || {
        hat.scan_status().unwrap().status.contains(ScanStatus::HW_OVERRUN)
    });

    let mut buf = vec![0.0; 2_000];
    let started = Instant::now();
    let read = hat.scan_read(1_000, 5.0, &mut buf).unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(read.samples_per_channel, 250);
    assert!(!read.timed_out);
    assert!(read.status.contains(ScanStatus::HW_OVERRUN));
    assert!(!read.status.contains(ScanStatus::RUNNING));
    hat.scan_cleanup().unwrap();
}

#[test]
fn capped_reads_keep_each_sample_on_its_channel() {
    let (_ctx, hat, control) = open(BoardSpec::MCC118);
    hat.calibration_coefficient_write(0, 1.0, 0.0).unwrap();
    hat.calibration_coefficient_write(1, 1.0, 1_000.0).unwrap();
    control.set_max_read(3);
    hat.scan_start(0b11, 50, 1000.0, ScanOptions::NO_SCALE_DATA).unwrap();
    control.produce(50);

    let mut buf = vec![0.0; 100];
    let read = hat.scan_read(50, 5.0, &mut buf).unwrap();
    assert_eq!(read.samples_per_channel, 50);
    for (i, &value) in buf.iter().enumerate() {
        let offset = if i % 2 == 1 { 1_000.0 } else { 0.0 };
        assert_eq!(value, i as f64 + offset, "sample {i}");
    }
    // 100 samples in requests of at most 3
    assert_eq!(control.count_opcode(CMD_AIN_SCAN_DATA), 34);
    hat.scan_cleanup().unwrap();
}

#[test]
fn scan_survives_a_bus_outage() {
    let (_ctx, hat, control) = open(BoardSpec::MCC118);
    hat.scan_start(0b11, 0, 1000.0, ScanOptions::CONTINUOUS | RAW).unwrap();
    control.produce(250);
    wait_until("data", || available(&hat) == 250);

    control.set_fail_io(true);
    control.produce(250);
    thread::sleep(Duration::from_millis(20));
    let info = hat.scan_status().unwrap();
    assert_eq!(info.samples_available, 250);
    assert!(info.status.contains(ScanStatus::RUNNING));

    control.set_fail_io(false);
    wait_until("data after recovery", || available(&hat) == 500);
    let mut buf = vec![0.0; 1_000];
    let read = hat.scan_read(-1, 0.0, &mut buf).unwrap();
    assert_eq!(read.samples_per_channel, 500);
    for (i, &value) in buf.iter().enumerate() {
        assert_eq!(value, i as f64, "sample {i}");
    }

    let started = Instant::now();
    hat.scan_cleanup().unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(control.opcodes().last(), Some(&CMD_AIN_SCAN_STOP));
    assert!(!control.is_running());
}

#[test]
fn busy_replies_are_reported_or_retried() {
    let (_ctx, hat, control) = open(BoardSpec::MCC118);
    control.force_next_status(0x03);
    assert!(matches!(
        hat.scan_start(0b11, 0, 1000.0, ScanOptions::CONTINUOUS),
        Err(HatError::Busy)
    ));
    assert_eq!(hat.scan_channel_count(), 0);

    hat.scan_start(0b11, 0, 1000.0, ScanOptions::CONTINUOUS | RAW).unwrap();
    // the FIFO is empty, so the next request is a status poll
    control.force_next_status(0x03);
    control.produce(250);
    wait_until("data past the busy poll", || available(&hat) == 250);
    let status = hat.scan_status().unwrap().status;
    assert!(status.contains(ScanStatus::RUNNING));
    assert!(!status.is_overrun());
    hat.scan_cleanup().unwrap();
}

#[test]
fn ranged_board_calibrates_per_range() {
    let (_ctx, hat, control) = open(BoardSpec::MCC128);
    hat.range_write(1).unwrap();
    hat.calibration_coefficient_write(1, 2.0, 10.0).unwrap();
    hat.scan_start(0b1, 2, 1000.0, ScanOptions::NO_SCALE_DATA).unwrap();
    control.produce(2);

    let mut buf = vec![0.0; 2];
    let read = hat.scan_read(2, 5.0, &mut buf).unwrap();
    assert_eq!(read.samples_per_channel, 2);
    assert_eq!(buf, [10.0, 12.0]);
    hat.scan_cleanup().unwrap();
}

#[test]
fn ranged_board_scales_to_the_selected_range() {
    let (_ctx, hat, control) = open(BoardSpec::MCC128);
    hat.range_write(1).unwrap();
    hat.scan_start(0b1, 2, 1000.0, ScanOptions::empty()).unwrap();
    control.produce(2);

    let mut buf = vec![0.0; 2];
    hat.scan_read(2, 5.0, &mut buf).unwrap();
    let lsb = lsb_size(&BoardSpec::MCC128.format, -5.0, 5.0);
    assert!(approx(buf[0], -5.0));
    assert!(approx(buf[1], -5.0 + lsb));
    hat.scan_cleanup().unwrap();
}

#[test]
fn iepe_board_scales_by_sensitivity() {
    let (_ctx, hat, control) = open(BoardSpec::MCC172);
    hat.sensitivity_write(0, 100.0).unwrap();
    hat.scan_start(0b01, 4, 0.0, ScanOptions::empty()).unwrap();
    assert_eq!(hat.scan_sample_rate().unwrap(), 51_200.0);
    control.produce(4);

    let mut buf = vec![0.0; 4];
    let read = hat.scan_read(4, 5.0, &mut buf).unwrap();
    assert_eq!(read.samples_per_channel, 4);

    let lsb = lsb_size(&BoardSpec::MCC172.format, -5.0, 5.0);
    assert_eq!(buf[0], 0.0);
    assert!(approx(buf[1], lsb / 0.1));
    assert!(approx(buf[3], 3.0 * lsb / 0.1));
    hat.scan_cleanup().unwrap();
}

#[test]
fn closing_the_last_handle_ends_the_scan() {
    let (ctx, hat, control) = open(BoardSpec::MCC118);
    hat.scan_start(0b1, 0, 1000.0, ScanOptions::CONTINUOUS).unwrap();
    ctx.close(0).unwrap();
    assert!(!ctx.is_open(0));
    assert_eq!(hat.scan_channel_count(), 0);
    wait_until("device stop", || !control.is_running());
}
