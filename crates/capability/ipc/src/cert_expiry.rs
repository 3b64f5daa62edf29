//! 证书到期监控
//!
//! 连接建立时启动，启动即检查一次，之后每天 UTC 零点检查。
//! 只记录日志，不影响会话。

use domain::now_epoch_ms;
use edge_telemetry::record_certificate_warning;
use rustls::pki_types::CertificateDer;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const SECONDS_PER_DAY: i64 = 24 * 60 * 60;

/// 证书主题与到期时间（epoch 秒）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub not_after: i64,
}

/// 单张证书的检查结果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryStatus {
    Valid { until: i64 },
    ExpiringSoon { remaining_days: i64 },
    Expired,
}

/// 解析证书的主题与到期时间，无法解析的证书跳过。
pub fn inspect_certificates(certificates: &[CertificateDer<'_>]) -> Vec<CertificateInfo> {
    certificates
        .iter()
        .filter_map(|der| match x509_parser::parse_x509_certificate(der.as_ref()) {
            Ok((_, cert)) => Some(CertificateInfo {
                subject: cert.subject().to_string(),
                not_after: cert.validity().not_after.timestamp(),
            }),
            Err(e) => {
                warn!(target: "edge.ipc", error = %e, "certificate_parse_failed");
                None
            }
        })
        .collect()
}

pub fn evaluate(certificate: &CertificateInfo, now: i64, warning_days: i64) -> ExpiryStatus {
    if now > certificate.not_after {
        ExpiryStatus::Expired
    } else if now > certificate
        .not_after
        .saturating_sub(warning_days.saturating_mul(SECONDS_PER_DAY))
    {
        ExpiryStatus::ExpiringSoon {
            remaining_days: (certificate.not_after - now) / SECONDS_PER_DAY,
        }
    } else {
        ExpiryStatus::Valid {
            until: certificate.not_after,
        }
    }
}

/// 检查并记录全部证书。
pub fn check_certificates(
    certificates: &[CertificateInfo],
    now: i64,
    warning_days: i64,
) -> Vec<ExpiryStatus> {
    certificates
        .iter()
        .map(|certificate| {
            let status = evaluate(certificate, now, warning_days);
            match status {
                ExpiryStatus::Expired => {
                    record_certificate_warning();
                    error!(
                        target: "edge.ipc",
                        subject = %certificate.subject,
                        not_after = certificate.not_after,
                        "certificate_expired"
                    );
                }
                ExpiryStatus::ExpiringSoon { remaining_days } => {
                    record_certificate_warning();
                    warn!(
                        target: "edge.ipc",
                        subject = %certificate.subject,
                        remaining_days,
                        "certificate_expiring"
                    );
                }
                ExpiryStatus::Valid { until } => {
                    info!(
                        target: "edge.ipc",
                        subject = %certificate.subject,
                        valid_until = until,
                        "certificate_valid"
                    );
                }
            }
            status
        })
        .collect()
}

/// 距下一个 UTC 零点的秒数。
pub fn secs_until_next_utc_midnight(now: i64) -> u64 {
    let elapsed = now.rem_euclid(SECONDS_PER_DAY);
    (SECONDS_PER_DAY - elapsed) as u64
}

/// 后台到期检查任务句柄。
#[derive(Debug, Default)]
pub struct ExpiryMonitor {
    handle: Option<JoinHandle<()>>,
}

impl ExpiryMonitor {
    /// 启动监控；证书为空或告警天数 ≤ 0 时不启动。
    pub fn start(certificates: Vec<CertificateInfo>, warning_days: i64) -> Self {
        if certificates.is_empty() || warning_days <= 0 {
            return Self::default();
        }

        let handle = tokio::spawn(async move {
            loop {
                let now = now_epoch_ms() / 1000;
                check_certificates(&certificates, now, warning_days);
                let wait = secs_until_next_utc_midnight(now_epoch_ms() / 1000);
                tokio::time::sleep(Duration::from_secs(wait)).await;
            }
        });
        Self {
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// 取消后台任务；可重复调用。
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cert(not_after: i64) -> CertificateInfo {
        CertificateInfo {
            subject: "CN=test".to_string(),
            not_after,
        }
    }

    #[test]
    fn test_evaluate_boundaries() {
        let now = 1_700_000_000;
        assert_eq!(evaluate(&cert(now - 1), now, 30), ExpiryStatus::Expired);
        assert_eq!(
            evaluate(&cert(now + 5 * SECONDS_PER_DAY), now, 30),
            ExpiryStatus::ExpiringSoon { remaining_days: 5 }
        );
        assert_eq!(
            evaluate(&cert(now + 31 * SECONDS_PER_DAY), now, 30),
            ExpiryStatus::Valid {
                until: now + 31 * SECONDS_PER_DAY
            }
        );
    }

    #[test]
    fn test_evaluate_huge_warning_period() {
        let now = 1_700_000_000;
        assert_eq!(
            evaluate(&cert(now + 10 * SECONDS_PER_DAY), now, i64::MAX),
            ExpiryStatus::ExpiringSoon { remaining_days: 10 }
        );
        assert_eq!(evaluate(&cert(now - 1), now, i64::MAX), ExpiryStatus::Expired);
    }

    #[test]
    fn test_next_midnight() {
        assert_eq!(secs_until_next_utc_midnight(0), 86_400);
        assert_eq!(secs_until_next_utc_midnight(86_400 - 10), 10);
        assert_eq!(secs_until_next_utc_midnight(86_400 + 3600), 82_800);
    }

    #[tokio::test]
    async fn test_monitor_noop_without_certificates() {
        let mut monitor = ExpiryMonitor::start(Vec::new(), 30);
        assert!(!monitor.is_running());
        monitor.stop();
        monitor.stop();

        let mut disabled = ExpiryMonitor::start(vec![cert(i64::MAX / 2)], 0);
        assert!(!disabled.is_running());
        disabled.stop();
    }

    #[tokio::test]
    async fn test_monitor_stop_cancels_task() {
        let mut monitor = ExpiryMonitor::start(vec![cert(now_epoch_ms() / 1000 + 100)], 30);
        assert!(monitor.is_running());
        monitor.stop();
        assert!(!monitor.is_running());
    }
}
