use crate::core::profile::DeviceProfile;
use crate::core::store::MemberSpace;
use crate::core::transport::{BootFlags, DeviceSession, InstallState, TransportError};

/// Inputs to the precheck rules. Each fact is read on its own; a failed read
/// is kept as its error text.
#[derive(Debug, Clone)]
pub struct DeviceFacts {
    /// Filesystem images are installed from.
    pub filesystem: String,
    pub version: Result<String, String>,
    /// Running a monolithic `.bin` rather than `packages.conf`.
    pub bundle_mode: bool,
    pub boot_variable: Result<String, String>,
    pub members: Result<Vec<MemberSpace>, String>,
    pub boot_flags: Result<BootFlags, String>,
    pub install_state: Result<InstallState, String>,
    /// `None` when no target image was given.
    pub image_present: Option<Result<bool, String>>,
}

/// Authentication failures end gathering; anything else becomes the fact's
/// error.
fn keep<T>(result: Result<T, TransportError>) -> Result<Result<T, String>, TransportError> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(err) if err.is_auth() => Err(err),
        Err(err) => Ok(Err(err.to_string())),
    }
}

/// Free space of every member that holds images: each stack member on a
/// stack-capable device, the single filesystem otherwise.
pub async fn member_space(
    session: &mut DeviceSession,
    profile: &DeviceProfile,
) -> Result<Result<Vec<MemberSpace>, String>, TransportError> {
    let numbers = if profile.stack_capable {
        match keep(session.stack_members().await)? {
            Ok(numbers) => numbers,
            Err(err) => return Ok(Err(err)),
        }
    } else {
        vec![1]
    };

    let mut members = Vec::with_capacity(numbers.len());
    for number in numbers {
        let filesystem = profile.member_filesystem(number);
        let usage = keep(session.filesystem_usage(&filesystem).await)?.ok();
        members.push(MemberSpace {
            member: number,
            filesystem,
            free_bytes: usage.map(|u| u.free_bytes),
            total_bytes: usage.and_then(|u| u.total_bytes),
        });
    }
    Ok(Ok(members))
}

/// Bundle mode is read from the boot variable, which both channels report
/// the same way. The running image name, only known over the command
/// channel, decides when the boot variable is unreadable or empty.
fn boots_bundle(boot_variable: &Result<String, String>, system_image: Option<&str>) -> bool {
    match boot_variable {
        Ok(boot) if !boot.trim().is_empty() => {
            !boot.to_ascii_lowercase().contains("packages.conf")
        }
        _ => system_image
            .map(|image| image.to_ascii_lowercase().ends_with(".bin"))
            .unwrap_or(false),
    }
}

pub async fn gather_facts(
    session: &mut DeviceSession,
    profile: &DeviceProfile,
    target_image: Option<&str>,
) -> Result<DeviceFacts, TransportError> {
    let system = keep(session.system_facts().await)?;
    let boot_variable = keep(session.boot_variable(profile.family).await)?;
    let running_image = system
        .as_ref()
        .ok()
        .and_then(|facts| facts.system_image.as_deref());
    let bundle_mode = boots_bundle(&boot_variable, running_image);
    let version = system.map(|facts| facts.version);

    let members = member_space(session, profile).await?;
    let boot_flags = keep(session.boot_flags(profile.family).await)?;
    let install_state = if bundle_mode {
        Ok(InstallState::Unknown)
    } else {
        keep(session.install_state().await)?
    };
    let image_present = match target_image {
        Some(filename) => Some(keep(session.file_exists(&profile.filesystem, filename).await)?),
        None => None,
    };

    Ok(DeviceFacts {
        filesystem: profile.filesystem.clone(),
        version,
        bundle_mode,
        boot_variable,
        members,
        boot_flags,
        install_state,
        image_present,
    })
}
