// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! `service` subcommand: host service-manager integration.
//!
//! Per §1 this is an external collaborator (service-manager integration),
//! so it stays a documented stub here rather than shelling out to
//! systemd/launchd/sc.exe — the CLI surface contract (§4.K) is still honored
//! with a clear, non-zero-exit error instead of a missing subcommand.

use crate::{cli::ServiceCmd, error::{DnsflowError, Result}};

pub fn run(cmd: ServiceCmd) -> Result<()> {
    let action = match cmd {
        ServiceCmd::Install => "install",
        ServiceCmd::Uninstall => "uninstall",
        ServiceCmd::Start => "start",
        ServiceCmd::Stop => "stop",
        ServiceCmd::Restart => "restart",
        ServiceCmd::Status => "status",
    };
    Err(DnsflowError::Other(anyhow::anyhow!(
        "service {} is unsupported on this platform; integrate with your host \
         service manager (systemd/launchd/sc.exe) directly",
        action
    )))
}
