mod mounts;
mod paths;

pub use mounts::{
    create_private_dir, MountEntry, MountMap, MountMode, MountPlanner, MountRequest, CONFIG_MOUNT,
    SKILLS_MOUNT, UPLOADS_MOUNT,
};
pub use paths::{to_host, PathContext, SESSIONS_PREFIX};
