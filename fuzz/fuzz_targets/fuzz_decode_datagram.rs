#![no_main]
use helios::protocol::{
    BroadcastEvent, DeviceCommand, ReportId, Report1, Report2, Report3, decode,
};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let response = decode(data);

    // Matching and typed parsing must never panic on arbitrary datagrams
    for id in [ReportId::Info, ReportId::Status, ReportId::Metering] {
        let _ = DeviceCommand::Report(id).expectation().matches(&response);
    }
    let _ = BroadcastEvent::from_response(&response);

    if let Some(fields) = response.fields() {
        let _ = Report1::from_fields(fields);
        if let Ok(status) = Report2::from_fields(fields) {
            let _ = status.is_charging();
        }
        if let Ok(metering) = Report3::from_fields(fields) {
            let _ = metering.power_watt();
            let _ = metering.active_phases(1000);
        }
    }
});
