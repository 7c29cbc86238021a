//! The table of recognized OS series. Entities target one or more of
//! these; multi-series charms must keep their declared list within a
//! single family.

use charmurl::BUNDLE_SERIES;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OsFamily {
    Ubuntu,
    CentOs,
    Windows,
    /// The pseudo-family of the `bundle` series.
    Bundle,
}

/// Look up the OS family of a series, or None if the series is not
/// recognized.
pub fn os_family(series: &str) -> Option<OsFamily> {
    let family = match series {
        "oneiric" | "precise" | "quantal" | "raring" | "saucy" | "trusty" | "utopic"
        | "vivid" | "wily" | "xenial" => OsFamily::Ubuntu,
        "centos7" => OsFamily::CentOs,
        "win2012" | "win2012r2" | "win2012hv" | "win2012hvr2" | "win7" | "win8" | "win81"
        | "win10" => OsFamily::Windows,
        BUNDLE_SERIES => OsFamily::Bundle,
        _ => return None,
    };
    Some(family)
}

/// Whether a series may appear in an entity identifier. This includes the
/// `bundle` pseudo-series; charm metadata validation additionally excludes
/// it from declared series lists.
pub fn known_series(series: &str) -> bool {
    os_family(series).is_some()
}
