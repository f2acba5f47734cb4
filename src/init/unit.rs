//! Unit file rendering
//!
//! Templates are plain text with `{{name}}` placeholders. Placeholders that
//! aren't known variables are left untouched, so docker format strings such
//! as `{{.State.Running}}` survive rendering.

use std::collections::BTreeMap;

use crate::Result;

pub const SYSTEMD_SERVICE: &str = "docker-container.service";
pub const SYSTEMD_SOCKET: &str = "docker-container.socket";
pub const UPSTART_CONF: &str = "docker-container.conf";
pub const SYSV_SCRIPT: &str = "docker-container.sysv";
pub const RUNIT_RUN: &str = "docker-container";

const SYSTEMD_SERVICE_TEXT: &str = "\
[Unit]
Description={{service_name}} container
Requires=docker.service
After=docker.service

[Service]
Restart=always
ExecStart=/usr/bin/docker start -a {{service_name}}
ExecStop=/usr/bin/docker stop -t {{cmd_timeout}} {{service_name}}
TimeoutStopSec={{cmd_timeout}}

[Install]
WantedBy=multi-user.target
";

const SYSTEMD_SOCKET_TEXT: &str = "\
[Unit]
Description={{service_name}} container sockets

[Socket]
{{listen_streams}}

[Install]
WantedBy=sockets.target
";

const UPSTART_CONF_TEXT: &str = "\
description \"{{service_name}} container\"
start on filesystem and started docker
stop on runlevel [!2345]
respawn

script
  exec /usr/bin/docker start -a {{service_name}}
end script

pre-stop exec /usr/bin/docker stop -t {{cmd_timeout}} {{service_name}}
";

const SYSV_SCRIPT_TEXT: &str = "\
#!/bin/sh
### BEGIN INIT INFO
# Provides:          {{service_name}}
# Required-Start:    docker
# Required-Stop:     docker
# Default-Start:     2 3 4 5
# Default-Stop:      0 1 6
# Short-Description: {{service_name}} container
### END INIT INFO

case \"$1\" in
  start)
    /usr/bin/docker start {{service_name}}
    ;;
  stop)
    /usr/bin/docker stop -t {{cmd_timeout}} {{service_name}}
    ;;
  restart)
    /usr/bin/docker restart -t {{cmd_timeout}} {{service_name}}
    ;;
  status)
    /usr/bin/docker inspect -f '{{.State.Running}}' {{service_name}}
    ;;
  *)
    echo \"Usage: $0 {start|stop|restart|status}\"
    exit 1
    ;;
esac
";

const RUNIT_RUN_TEXT: &str = "\
#!/bin/sh
exec 2>&1
exec /usr/bin/docker start -a {{service_name}}
";

fn builtin(name: &str) -> Option<&'static str> {
    match name {
        SYSTEMD_SERVICE => Some(SYSTEMD_SERVICE_TEXT),
        SYSTEMD_SOCKET => Some(SYSTEMD_SOCKET_TEXT),
        UPSTART_CONF => Some(UPSTART_CONF_TEXT),
        SYSV_SCRIPT => Some(SYSV_SCRIPT_TEXT),
        RUNIT_RUN => Some(RUNIT_RUN_TEXT),
        _ => None,
    }
}

/// Render a built-in template by name, or a template file by path
pub fn render(template: &str, variables: &BTreeMap<String, String>) -> Result<String> {
    let text = match builtin(template) {
        Some(text) => text.to_string(),
        None => std::fs::read_to_string(template)?,
    };
    Ok(substitute(&text, variables))
}

fn substitute(text: &str, variables: &BTreeMap<String, String>) -> String {
    variables.iter().fold(text.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{{{}}}}}", key), value)
    })
}

/// `ListenStream=` lines for a space separated port list
pub fn listen_streams(sockets: &str) -> String {
    sockets
        .split_whitespace()
        .map(|port| format!("ListenStream={}", port))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn vars() -> BTreeMap<String, String> {
        let mut vars = BTreeMap::new();
        vars.insert("service_name".to_string(), "web".to_string());
        vars.insert("cmd_timeout".to_string(), "30".to_string());
        vars
    }

    #[test]
    fn test_render_systemd_service() {
        let text = render(SYSTEMD_SERVICE, &vars()).unwrap();
        assert!(text.contains("ExecStart=/usr/bin/docker start -a web"));
        assert!(text.contains("ExecStop=/usr/bin/docker stop -t 30 web"));
        assert!(!text.contains("{{service_name}}"));
    }

    #[test]
    fn test_unknown_placeholders_survive() {
        let text = render(SYSV_SCRIPT, &vars()).unwrap();
        assert!(text.contains("'{{.State.Running}}' web"));
    }

    #[test]
    fn test_render_template_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "run {{{{service_name}}}} for {{{{cmd_timeout}}}}s").unwrap();

        let text = render(file.path().to_str().unwrap(), &vars()).unwrap();
        assert_eq!(text, "run web for 30s");
    }

    #[test]
    fn test_missing_template_file() {
        assert!(render("/nonexistent/template.erb", &vars()).is_err());
    }

    #[test]
    fn test_listen_streams() {
        assert_eq!(listen_streams("80 443"), "ListenStream=80\nListenStream=443");
        assert_eq!(listen_streams(""), "");
    }
}
