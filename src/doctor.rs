//! `clawd-browser doctor` — quick environment sanity check: is the browser
//! binary runnable, are the configured ports free, is the data directory
//! writable. Mirrors the pass/fail report style the daemon's health check
//! uses, but runs standalone with no running daemon required.

use crate::config::DaemonConfig;
use std::time::Duration;

pub struct DoctorCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

pub async fn run_doctor(config: &DaemonConfig) -> Vec<DoctorCheck> {
    vec![
        check_browser_binary(&config.browser.browser_binary).await,
        check_port_free("control plane", config.port).await,
        check_port_free("REST surface", config.rest_port).await,
        check_data_dir_writable(&config.data_dir),
    ]
}

async fn check_browser_binary(binary: &str) -> DoctorCheck {
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::process::Command::new(binary).arg("--version").output(),
    )
    .await;

    match result {
        Ok(Ok(output)) if output.status.success() => DoctorCheck {
            name: "browser binary".to_string(),
            passed: true,
            detail: format!("{binary} --version succeeded"),
        },
        Ok(Ok(output)) => DoctorCheck {
            name: "browser binary".to_string(),
            passed: false,
            detail: format!("{binary} --version exited with {}", output.status),
        },
        Ok(Err(e)) => DoctorCheck {
            name: "browser binary".to_string(),
            passed: false,
            detail: format!("could not run {binary}: {e}"),
        },
        Err(_) => DoctorCheck {
            name: "browser binary".to_string(),
            passed: false,
            detail: format!("{binary} --version timed out"),
        },
    }
}

async fn check_port_free(label: &str, port: u16) -> DoctorCheck {
    let bind = format!("127.0.0.1:{port}");
    match tokio::net::TcpListener::bind(&bind).await {
        Ok(_) => DoctorCheck {
            name: format!("{label} port {port}"),
            passed: true,
            detail: format!("{bind} is free"),
        },
        Err(e) => DoctorCheck {
            name: format!("{label} port {port}"),
            passed: false,
            detail: format!("{bind} unavailable: {e}"),
        },
    }
}

fn check_data_dir_writable(data_dir: &std::path::Path) -> DoctorCheck {
    match std::fs::create_dir_all(data_dir) {
        Ok(()) => {
            let probe = data_dir.join(".doctor-probe");
            match std::fs::write(&probe, b"ok") {
                Ok(()) => {
                    let _ = std::fs::remove_file(&probe);
                    DoctorCheck {
                        name: "data directory".to_string(),
                        passed: true,
                        detail: format!("{} is writable", data_dir.display()),
                    }
                }
                Err(e) => DoctorCheck {
                    name: "data directory".to_string(),
                    passed: false,
                    detail: format!("{} is not writable: {e}", data_dir.display()),
                },
            }
        }
        Err(e) => DoctorCheck {
            name: "data directory".to_string(),
            passed: false,
            detail: format!("could not create {}: {e}", data_dir.display()),
        },
    }
}

pub fn print_doctor_results(results: &[DoctorCheck]) {
    for check in results {
        let mark = if check.passed { "ok" } else { "FAIL" };
        println!("[{mark}] {}: {}", check.name, check.detail);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reports_missing_binary() {
        let check = check_browser_binary("definitely-not-a-real-binary-xyz").await;
        assert!(!check.passed);
    }

    #[tokio::test]
    async fn reports_free_port() {
        // Port 0 is reserved and always fails to bind literally as "0" isn't
        // meaningful here, so pick an ephemeral one the OS is likely to have free.
        let check = check_port_free("test", 18273).await;
        assert!(check.passed || check.detail.contains("unavailable"));
    }

    #[test]
    fn data_dir_probe_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let check = check_data_dir_writable(dir.path());
        assert!(check.passed);
    }
}
