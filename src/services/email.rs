use std::net::IpAddr;
use std::time::Duration;

use anyhow::Context;
use lettre::{
    message::{header::ContentType, Mailbox, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde_json::Value;
use uuid::Uuid;

use crate::config::Config;
use crate::models::tenant::Tenant;
use crate::services::encryption;

pub const ALLOWED_SMTP_PORTS: [u16; 4] = [25, 465, 587, 2525];
/// Hard ceiling for a single SMTP send.
const SEND_TIMEOUT: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// ─── Template whitelist ─────────────────────────────────────────────────────

/// Closed set of deliverable templates. Anything else fails validation at
/// enqueue time, so untrusted callers cannot smuggle template paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmailTemplate {
    PasswordReset,
    EmailVerify,
    EmailChangeConfirm,
    Invitation,
    SecurityAlert,
}

impl EmailTemplate {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailTemplate::PasswordReset => "password_reset",
            EmailTemplate::EmailVerify => "email_verify",
            EmailTemplate::EmailChangeConfirm => "email_change_confirm",
            EmailTemplate::Invitation => "invitation",
            EmailTemplate::SecurityAlert => "security_alert",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "password_reset" => Some(Self::PasswordReset),
            "email_verify" => Some(Self::EmailVerify),
            "email_change_confirm" => Some(Self::EmailChangeConfirm),
            "invitation" => Some(Self::Invitation),
            "security_alert" => Some(Self::SecurityAlert),
            _ => None,
        }
    }
}

// ─── Egress validation ──────────────────────────────────────────────────────

/// Returns the reason a destination address is blocked, or None if routable.
/// Covers loopback, RFC 1918/4193 private space, link-local (including the
/// cloud metadata address), CGNAT, benchmark, TEST-NET and reserved ranges.
pub fn blocked_range(ip: IpAddr) -> Option<&'static str> {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            if v4.is_loopback() {
                Some("loopback")
            } else if v4.is_unspecified() {
                Some("unspecified")
            } else if v4.is_private() {
                Some("private range")
            } else if v4.is_link_local() {
                Some("link-local")
            } else if v4.is_multicast() {
                Some("multicast")
            } else if v4.is_broadcast() {
                Some("broadcast")
            } else if o[0] == 100 && (o[1] & 0xc0) == 64 {
                Some("shared address space")
            } else if o[0] == 192 && o[1] == 0 && o[2] == 0 {
                Some("reserved")
            } else if (o[0] == 192 && o[1] == 0 && o[2] == 2)
                || (o[0] == 198 && o[1] == 51 && o[2] == 100)
                || (o[0] == 203 && o[1] == 0 && o[2] == 113)
            {
                Some("documentation range")
            } else if o[0] == 198 && (o[1] & 0xfe) == 18 {
                Some("benchmark range")
            } else if o[0] >= 240 {
                Some("reserved")
            } else {
                None
            }
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return blocked_range(IpAddr::V4(mapped));
            }
            let seg = v6.segments();
            if v6.is_loopback() {
                Some("loopback")
            } else if v6.is_unspecified() {
                Some("unspecified")
            } else if v6.is_multicast() {
                Some("multicast")
            } else if (seg[0] & 0xfe00) == 0xfc00 {
                Some("unique-local")
            } else if (seg[0] & 0xffc0) == 0xfe80 {
                Some("link-local")
            } else {
                None
            }
        }
    }
}

/// Resolve the configured SMTP host and reject blocked destinations. Runs
/// before every delivery attempt, not only at configuration time, so a DNS
/// rebind between attempts is still caught.
pub async fn validate_smtp_host(host: &str, port: u16) -> Result<(), String> {
    if !ALLOWED_SMTP_PORTS.contains(&port) {
        return Err(format!("security violation: port {port} is not an allowed SMTP port"));
    }

    let addrs: Vec<IpAddr> = match host.parse::<IpAddr>() {
        Ok(ip) => vec![ip],
        Err(_) => tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| format!("security violation: cannot resolve SMTP host {host}: {e}"))?
            .map(|a| a.ip())
            .collect(),
    };

    if addrs.is_empty() {
        return Err(format!("security violation: SMTP host {host} resolved to no addresses"));
    }
    for ip in addrs {
        if let Some(reason) = blocked_range(ip) {
            return Err(format!(
                "security violation: SMTP host {host} resolves to a {reason} address"
            ));
        }
    }
    Ok(())
}

// ─── Transport configuration ────────────────────────────────────────────────

/// A resolved outbound-mail configuration; the password lives only in memory
/// at send time and must never be logged.
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from: String,
}

/// The tenant's own encrypted configuration wins; otherwise fall back to the
/// process-wide SMTP settings.
pub fn resolve_smtp_config(tenant: &Tenant, config: &Config) -> anyhow::Result<Option<SmtpConfig>> {
    if tenant.has_mail_config() {
        let version = tenant
            .smtp_key_version
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("tenant mail config has no key version"))?;
        let master = config
            .tenant_secret_keys
            .get(version)
            .ok_or_else(|| anyhow::anyhow!("no tenant secret key for version {version}"))?;
        let key = encryption::derive_tenant_key(master, tenant.id)?;
        let password = encryption::decrypt_secret(
            tenant.smtp_password_enc.as_deref().unwrap_or_default(),
            tenant.smtp_password_nonce.as_deref().unwrap_or_default(),
            &key,
        )?;
        return Ok(Some(SmtpConfig {
            host: tenant.smtp_host.clone().unwrap_or_default(),
            port: tenant.smtp_port.unwrap_or(587) as u16,
            username: tenant.smtp_username.clone().unwrap_or_default(),
            password: String::from_utf8(password).context("mail password is not valid UTF-8")?,
            from: tenant.smtp_from.clone().unwrap_or_default(),
        }));
    }

    match (&config.smtp_host, &config.smtp_username, &config.smtp_password, &config.smtp_from) {
        (Some(host), Some(user), Some(pass), Some(from)) => Ok(Some(SmtpConfig {
            host: host.clone(),
            port: config.smtp_port.unwrap_or(587),
            username: user.clone(),
            password: pass.clone(),
            from: from.clone(),
        })),
        _ => Ok(None),
    }
}

/// Deliver one rendered message. The caller has already passed egress
/// validation for `cfg.host`.
pub async fn send_mail(
    cfg: &SmtpConfig,
    recipient: &str,
    subject: &str,
    text: &str,
    html: &str,
) -> anyhow::Result<String> {
    let creds = Credentials::new(cfg.username.clone(), cfg.password.clone());

    let transport = if cfg.port == 465 {
        AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
            .context("invalid SMTP relay host")?
            .port(cfg.port)
            .credentials(creds)
            .timeout(Some(CONNECT_TIMEOUT))
            .build()
    } else {
        AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
            .context("invalid SMTP relay host")?
            .port(cfg.port)
            .credentials(creds)
            .timeout(Some(CONNECT_TIMEOUT))
            .build()
    };

    let from: Mailbox = cfg.from.parse().context("invalid From address")?;
    let to: Mailbox = recipient.parse().context("invalid recipient address")?;
    let message_id = format!("<{}@{}>", Uuid::new_v4(), from.email.domain());

    let email = Message::builder()
        .message_id(Some(message_id.clone()))
        .from(from)
        .to(to)
        .subject(subject)
        .multipart(
            MultiPart::alternative()
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_PLAIN)
                        .body(text.to_string()),
                )
                .singlepart(
                    SinglePart::builder()
                        .header(ContentType::TEXT_HTML)
                        .body(html.to_string()),
                ),
        )
        .context("failed to build email message")?;

    tokio::time::timeout(SEND_TIMEOUT, transport.send(email))
        .await
        .map_err(|_| anyhow::anyhow!("SMTP send timed out"))?
        .context("failed to send email")?;

    Ok(message_id)
}

// ─── Rendering ──────────────────────────────────────────────────────────────

/// Render a whitelisted template. `data` carries the template variables the
/// enqueuing request serialised (action link, display name, tenant name).
pub fn render(template: EmailTemplate, data: &Value) -> (String, String, String) {
    let tenant_name = str_field(data, "tenant_name");
    let name = str_field(data, "name");
    let link = str_field(data, "link");

    let (subject, headline, body_text, cta) = match template {
        EmailTemplate::PasswordReset => (
            format!("Password reset — {tenant_name}"),
            "Reset your password".to_string(),
            format!(
                "Hello {name},\n\nA password reset was requested for your account at {tenant_name}.\n\
                 Use this link within 15 minutes:\n{link}\n\nIf you did not request this, ignore this email."
            ),
            Some(("Reset password", link.clone())),
        ),
        EmailTemplate::EmailVerify => (
            format!("Verify your email — {tenant_name}"),
            "Verify your email address".to_string(),
            format!(
                "Hello {name},\n\nConfirm your email address for {tenant_name} within 24 hours:\n{link}"
            ),
            Some(("Verify email", link.clone())),
        ),
        EmailTemplate::EmailChangeConfirm => (
            format!("Confirm your new email — {tenant_name}"),
            "Confirm your new email address".to_string(),
            format!(
                "Hello {name},\n\nConfirm the change of your account email for {tenant_name}:\n{link}\n\n\
                 If you did not request this change, change your password immediately."
            ),
            Some(("Confirm change", link.clone())),
        ),
        EmailTemplate::Invitation => {
            let role = str_field(data, "role");
            (
                format!("You are invited to join {tenant_name}"),
                "You are invited".to_string(),
                format!(
                    "You have been invited to join {tenant_name} as {role}.\n\
                     Create your account within 7 days:\n{link}"
                ),
                Some(("Create account", link.clone())),
            )
        }
        EmailTemplate::SecurityAlert => (
            format!("Security alert — {tenant_name}"),
            "Your sessions were signed out".to_string(),
            format!(
                "Hello {name},\n\nA sign-in token for your {tenant_name} account was used after it had \
                 been superseded, so all sessions were revoked as a precaution. Sign in again and review \
                 your account activity."
            ),
            None,
        ),
    };

    let button = cta
        .filter(|(_, url)| !url.is_empty())
        .map(|(label, url)| {
            format!(
                r#"<table role="presentation" cellpadding="0" cellspacing="0" style="margin:24px 0">
  <tr>
    <td style="border-radius:8px;background:#2563eb">
      <a href="{url}" style="display:inline-block;padding:13px 28px;color:#ffffff;text-decoration:none;font-weight:600;font-size:15px;border-radius:8px">{label}</a>
    </td>
  </tr>
</table>"#
            )
        })
        .unwrap_or_default();

    let html = wrap_html(
        &tenant_name,
        &format!(
            r#"<h1 style="margin:0 0 8px 0;font-size:22px;font-weight:700;color:#0f172a">{headline}</h1>
<p style="margin:0 0 16px 0;font-size:15px;color:#64748b;line-height:1.6">{}</p>
{button}"#,
            body_text.replace('\n', "<br>")
        ),
    );

    (subject, body_text, html)
}

fn str_field(data: &Value, key: &str) -> String {
    data.get(key).and_then(Value::as_str).unwrap_or_default().to_string()
}

/// Consistent branded layout around the template content.
fn wrap_html(tenant_name: &str, content: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head>
  <meta charset="utf-8">
  <meta name="viewport" content="width=device-width,initial-scale=1">
  <title>{tenant_name}</title>
</head>
<body style="margin:0;padding:0;background-color:#f1f5f9;font-family:-apple-system,BlinkMacSystemFont,'Segoe UI',Roboto,Helvetica,Arial,sans-serif">
  <table role="presentation" width="100%" cellpadding="0" cellspacing="0" style="background-color:#f1f5f9;padding:40px 16px">
    <tr>
      <td align="center">
        <table role="presentation" width="100%" cellpadding="0" cellspacing="0" style="max-width:520px">
          <tr>
            <td align="center" style="padding-bottom:28px">
              <p style="margin:0;font-size:20px;font-weight:700;color:#0f172a;text-align:center">{tenant_name}</p>
            </td>
          </tr>
          <tr>
            <td style="background:#ffffff;border-radius:12px;padding:40px;box-shadow:0 1px 3px rgba(0,0,0,0.08)">
              {content}
            </td>
          </tr>
          <tr>
            <td align="center" style="padding-top:20px">
              <p style="margin:0;font-size:12px;color:#94a3b8">{tenant_name}</p>
            </td>
          </tr>
        </table>
      </td>
    </tr>
  </table>
</body>
</html>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn template_whitelist_is_closed() {
        assert!(EmailTemplate::parse("password_reset").is_some());
        assert!(EmailTemplate::parse("invitation").is_some());
        assert!(EmailTemplate::parse("../../etc/passwd").is_none());
        assert!(EmailTemplate::parse("PASSWORD_RESET").is_none());
        assert!(EmailTemplate::parse("").is_none());
    }

    #[test]
    fn blocked_ranges_cover_the_policy_list() {
        let blocked = [
            "127.0.0.1",
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "169.254.169.254",
            "0.0.0.0",
            "224.0.0.1",
            "255.255.255.255",
            "100.64.0.1",
            "192.0.2.10",
            "198.51.100.7",
            "203.0.113.9",
            "198.18.0.1",
            "240.0.0.1",
        ];
        for addr in blocked {
            let ip: Ipv4Addr = addr.parse().unwrap();
            assert!(blocked_range(IpAddr::V4(ip)).is_some(), "{addr} should be blocked");
        }

        let blocked_v6 = ["::1", "::", "fc00::1", "fd12::1", "fe80::1", "ff02::1", "::ffff:127.0.0.1"];
        for addr in blocked_v6 {
            let ip: Ipv6Addr = addr.parse().unwrap();
            assert!(blocked_range(IpAddr::V6(ip)).is_some(), "{addr} should be blocked");
        }

        for addr in ["93.184.216.34", "8.8.8.8"] {
            let ip: Ipv4Addr = addr.parse().unwrap();
            assert!(blocked_range(IpAddr::V4(ip)).is_none(), "{addr} should be routable");
        }
    }

    #[tokio::test]
    async fn loopback_smtp_host_is_a_security_violation() {
        let err = validate_smtp_host("127.0.0.1", 587).await.unwrap_err();
        assert!(err.starts_with("security violation:"), "{err}");
    }

    #[tokio::test]
    async fn unusual_ports_are_rejected() {
        let err = validate_smtp_host("smtp.example.com", 8080).await.unwrap_err();
        assert!(err.contains("not an allowed SMTP port"));
        for port in ALLOWED_SMTP_PORTS {
            // Port check happens before resolution, so a blocked host still
            // exercises it.
            let err = validate_smtp_host("127.0.0.1", port).await.unwrap_err();
            assert!(!err.contains("allowed SMTP port"));
        }
    }

    #[test]
    fn rendering_carries_the_action_link() {
        let data = json!({
            "tenant_name": "Acme",
            "name": "Ada",
            "link": "https://acme.example.com/reset?token=abc",
        });
        let (subject, text, html) = render(EmailTemplate::PasswordReset, &data);
        assert!(subject.contains("Acme"));
        assert!(text.contains("https://acme.example.com/reset?token=abc"));
        assert!(html.contains("https://acme.example.com/reset?token=abc"));
    }
}
