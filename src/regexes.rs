//! Authoritative inbound regex contracts (spec.md §6), as `LazyLock<Regex>`
//! statics matching the teacher's `socket.rs`/`util.rs` style.
//!
//! Group names follow spec.md exactly so call sites can read
//! `caps.name("ntemp")` etc. without a separate lookup table.

use std::sync::LazyLock;

use regex::Regex;

pub static CONFIRMATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^ok.*$").unwrap());

pub static RESEND: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Resend: ?(?P<cmd_number>\d+)$").unwrap());

pub static TEMPERATURE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^ok ?T: ?(?P<ntemp>-?\d+\.\d+) ?/(?P<set_ntemp>-?\d+\.\d+) ?B: ?(?P<btemp>-?\d+\.\d+) ?/(?P<set_btemp>-?\d+\.\d+)",
    )
    .unwrap()
});

pub static POSITION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^X: ?(?P<x>-?\d+\.\d+) ?Y: ?(?P<y>-?\d+\.\d+) ?Z: ?(?P<z>-?\d+\.\d+)").unwrap()
});

pub static FAN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^E0:(?P<extruder_rpm>\d+) RPM PRN1:(?P<print_rpm>\d+) RPM E0@:(?P<extruder_power>\d+) PRN1@:(?P<print_power>\d+)",
    )
    .unwrap()
});

pub static SD_PRESENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SD card ok$").unwrap());
pub static SD_ABSENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^SD init fail$").unwrap());

pub static FILE_OPENED: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^File opened: ?(?P<sdn_lfn>[^ ]*) ?Size: ?(?P<size>\d+)").unwrap()
});

pub static START_PRINT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Print started$").unwrap());
pub static PRINT_DONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Print done$|^Done printing file$").unwrap());
pub static PAUSED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^// action:paused$").unwrap());
pub static RESUMED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^// action:resumed$").unwrap());
pub static CANCEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^// action:cancel$").unwrap());

pub static BUSY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^echo:busy: (processing|paused for user)$").unwrap());
pub static ATTENTION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^echo:busy: paused for user$").unwrap());

pub static GENERIC_ERROR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Error:.*$").unwrap());

pub static ERROR_REASON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<mintemp>MINTEMP)|(?P<maxtemp>MAXTEMP)) (?:error )?(?P<component>bed|hotend)|(?P<runaway>Thermal Runaway)|(?P<malfunction>Heater/Sensor malfunction)",
    )
    .unwrap()
});

pub static ATTENTION_REASON: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<not_triggered>Bed leveling sensor did not trigger)|(?P<triggered_high>Bed leveling sensor triggered too high)").unwrap()
});

pub static FAN_ERROR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Error:(?P<fan_name>Print|Extruder) fan speed is lower than expected$").unwrap()
});

pub static PRINTER_BOOT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^start$").unwrap());

pub static M73_PROGRESS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^M73 (?:Q(?P<mode>\d+) )?P(?P<progress>\d+)(?: R(?P<remaining>\d+))?").unwrap()
});

pub static M27_STATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?P<sdn_lfn>[^ ]+\.[Gg][Cc][Oo]?) (?P<byte>\d+)/(?P<total>\d+)|SD printing byte (?P<byte2>\d+)/(?P<total2>\d+)|Not SD printing)",
    )
    .unwrap()
});

pub static M110_ARG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^M110 ?N?(?P<number>\d+)?").unwrap());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resend_captures_number() {
        let caps = RESEND.captures("Resend: 12").unwrap();
        assert_eq!(&caps["cmd_number"], "12");
    }

    #[test]
    fn confirmation_matches_inline_temps() {
        assert!(CONFIRMATION.is_match("ok T:210.0 /210.0 B:60.0 /60.0"));
        assert!(CONFIRMATION.is_match("ok"));
    }

    #[test]
    fn temperature_groups() {
        let caps = TEMPERATURE
            .captures("ok T:210.1 /210.0 B:60.2 /60.0")
            .unwrap();
        assert_eq!(&caps["ntemp"], "210.1");
        assert_eq!(&caps["btemp"], "60.2");
    }

    #[test]
    fn fan_error_captures_name() {
        let caps = FAN_ERROR
            .captures("Error:Print fan speed is lower than expected")
            .unwrap();
        assert_eq!(&caps["fan_name"], "Print");
    }

    #[test]
    fn fan_rpm_groups() {
        let caps = FAN
            .captures("E0:3200 RPM PRN1:3200 RPM E0@:127 PRN1@:127")
            .unwrap();
        assert_eq!(&caps["print_rpm"], "3200");
        assert_eq!(&caps["print_power"], "127");
    }
}
