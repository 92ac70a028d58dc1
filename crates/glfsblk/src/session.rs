//! Volume connection and open-image sessions.

use tracing::{debug, error, warn};

use crate::config::DriverConfig;
use crate::error::{GlusterError, Result};
use crate::glfs::{GlfsClient, GlfsFd, GlfsVolume, OpenFlags};
use crate::uri::{parse_uri, GlusterConf};

/// Finalizes a volume handle that is being abandoned after an earlier error.
pub(crate) fn release_volume<V: GlfsVolume>(glfs: V, volname: &str) {
    if let Err(errno) = glfs.fini() {
        warn!(volname, %errno, "glfs_fini failed while releasing volume");
    }
}

/// Connects a volume handle for `conf`.
///
/// Allocates the handle, points it at the volfile server, routes the library's
/// log to the configured destination and connects. If any step after
/// allocation fails the handle is finalized and the error of the failing
/// step is returned.
pub fn gluster_init<C: GlfsClient>(
    client: &C,
    conf: &GlusterConf,
    config: &DriverConfig,
) -> Result<C::Volume> {
    let server = &conf.server;
    debug!(
        transport = %server.transport(),
        server = server.host(),
        port = server.port(),
        volume = %conf.volname,
        image = %conf.image,
        "connecting to gluster volume"
    );

    let mut glfs = client
        .new_volume(&conf.volname)
        .map_err(|errno| GlusterError::VolumeAlloc {
            volname: conf.volname.clone(),
            errno,
        })?;

    match configure_and_connect(&mut glfs, conf, config) {
        Ok(()) => Ok(glfs),
        Err(err) => {
            release_volume(glfs, &conf.volname);
            Err(err)
        }
    }
}

fn configure_and_connect<V: GlfsVolume>(
    glfs: &mut V,
    conf: &GlusterConf,
    config: &DriverConfig,
) -> Result<()> {
    let server = &conf.server;
    glfs.set_volfile_server(server.transport(), server.host(), server.port())
        .map_err(|errno| GlusterError::TransportSetup {
            transport: server.transport().to_string(),
            server: server.host().to_string(),
            port: server.port(),
            errno,
        })?;

    glfs.set_logging(&config.log_file, config.log_level)
        .map_err(|errno| GlusterError::Logging { errno })?;

    glfs.init().map_err(|errno| {
        error!(
            server = server.host(),
            port = server.port(),
            volume = %conf.volname,
            image = %conf.image,
            transport = %server.transport(),
            %errno,
            "Gluster connection failed"
        );
        GlusterError::ConnectFailed {
            server: server.host().to_string(),
            port: server.port(),
            volume: conf.volname.clone(),
            image: conf.image.clone(),
            transport: server.transport().to_string(),
            errno,
        }
    })
}

/// Parses `filename` and connects its volume.
pub fn gluster_connect<C: GlfsClient>(
    client: &C,
    filename: &str,
    config: &DriverConfig,
) -> Result<(C::Volume, GlusterConf)> {
    let conf = parse_uri(filename)?;
    let glfs = gluster_init(client, &conf, config)?;
    Ok((glfs, conf))
}

/// One opened image on one volume.
///
/// Holds both the volume handle and the image's file handle, or neither once
/// closed. Dropping a session closes it.
pub struct Session<V: GlfsVolume> {
    glfs: Option<V>,
    fd: Option<V::Fd>,
    conf: GlusterConf,
}

impl<V: GlfsVolume> Session<V> {
    /// Connects the volume named by `filename` and opens its image.
    ///
    /// Nothing is retained on failure.
    pub fn open<C>(
        client: &C,
        filename: &str,
        flags: OpenFlags,
        config: &DriverConfig,
    ) -> Result<Self>
    where
        C: GlfsClient<Volume = V>,
    {
        let (glfs, conf) = gluster_connect(client, filename, config)?;
        match glfs.open(&conf.image, flags) {
            Ok(fd) => {
                debug!(image = %conf.image, flags = flags.bits(), "gluster image opened");
                Ok(Self {
                    glfs: Some(glfs),
                    fd: Some(fd),
                    conf,
                })
            }
            Err(errno) => {
                release_volume(glfs, &conf.volname);
                Err(GlusterError::File {
                    op: "glfs_open",
                    path: conf.image,
                    errno,
                })
            }
        }
    }

    /// The open file handle.
    pub fn fd(&self) -> Result<&V::Fd> {
        self.fd.as_ref().ok_or(GlusterError::NotOpen)
    }

    /// The connected volume handle.
    pub fn volume(&self) -> Result<&V> {
        self.glfs.as_ref().ok_or(GlusterError::NotOpen)
    }

    /// Location this session was opened from.
    pub fn conf(&self) -> &GlusterConf {
        &self.conf
    }

    /// Returns true while both handles are held.
    pub fn is_open(&self) -> bool {
        self.glfs.is_some() && self.fd.is_some()
    }

    /// Closes the file, then finalizes the volume. Both are released even if
    /// the first step fails; the first error is returned.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let mut result = Ok(());
        if let Some(fd) = self.fd.take() {
            if let Err(errno) = fd.close() {
                result = Err(GlusterError::File {
                    op: "glfs_close",
                    path: self.conf.image.clone(),
                    errno,
                });
            }
        }
        if let Some(glfs) = self.glfs.take() {
            if let Err(errno) = glfs.fini() {
                if result.is_ok() {
                    result = Err(GlusterError::File {
                        op: "glfs_fini",
                        path: self.conf.volname.clone(),
                        errno,
                    });
                }
            }
        }
        result
    }
}

impl<V: GlfsVolume> Drop for Session<V> {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(image = %self.conf.image, %err, "failed to close gluster session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::glfs::{Errno, GlfsLogLevel};
    use crate::mock_glfs::{MockFaults, MockGlfs};
    use crate::uri::Transport;

    fn cluster() -> MockGlfs {
        let glfs = MockGlfs::new(1).unwrap();
        glfs.add_volume("testvol");
        glfs.write_file("testvol", "dir/a.img", &[0u8; 4096]).unwrap();
        glfs
    }

    #[test]
    fn test_init_configures_transport_and_logging() {
        let glfs = cluster();
        let conf = parse_uri("gluster+rdma://1.2.3.4:24007/testvol/dir/a.img").unwrap();
        let vol = gluster_init(&glfs, &conf, &DriverConfig::default()).unwrap();
        assert_eq!(
            glfs.volfile_servers(),
            vec![(Transport::Rdma, "1.2.3.4".to_string(), 24007)]
        );
        assert_eq!(
            glfs.logging_calls(),
            vec![("-".to_string(), GlfsLogLevel::Error)]
        );
        vol.fini().unwrap();
    }

    #[test]
    fn test_init_unix_passes_socket_and_zero_port() {
        let glfs = cluster();
        let conf =
            parse_uri("gluster+unix:///testvol/dir/a.img?socket=/tmp/glusterd.socket").unwrap();
        let vol = gluster_init(&glfs, &conf, &DriverConfig::default()).unwrap();
        assert_eq!(
            glfs.volfile_servers(),
            vec![(Transport::Unix, "/tmp/glusterd.socket".to_string(), 0)]
        );
        vol.fini().unwrap();
    }

    #[test]
    fn test_init_failure_releases_volume_and_keeps_errno() {
        let glfs = cluster();
        glfs.set_faults(MockFaults {
            init: Some(Errno(libc::ECONNREFUSED)),
            fini: Some(Errno(libc::EIO)),
            ..MockFaults::default()
        });
        let conf = parse_uri("gluster://1.2.3.4/testvol/dir/a.img").unwrap();
        let err = match gluster_init(&glfs, &conf, &DriverConfig::default()) {
            Ok(_) => panic!("init should fail"),
            Err(err) => err,
        };
        assert!(matches!(err, GlusterError::ConnectFailed { .. }));
        assert_eq!(err.to_errno(), libc::ECONNREFUSED);
        assert_eq!(glfs.live_volumes(), 0);
    }

    #[test]
    fn test_transport_and_logging_failures_release_volume() {
        let glfs = cluster();
        let conf = parse_uri("gluster://host/testvol/dir/a.img").unwrap();

        glfs.set_faults(MockFaults {
            set_volfile_server: Some(Errno(libc::EINVAL)),
            ..MockFaults::default()
        });
        let err = gluster_init(&glfs, &conf, &DriverConfig::default()).err();
        assert!(matches!(err, Some(GlusterError::TransportSetup { .. })));
        assert_eq!(glfs.live_volumes(), 0);

        glfs.set_faults(MockFaults {
            set_logging: Some(Errno(libc::EACCES)),
            ..MockFaults::default()
        });
        let err = gluster_init(&glfs, &conf, &DriverConfig::default()).err();
        assert_eq!(err.map(|e| e.to_errno()), Some(libc::EACCES));
        assert_eq!(glfs.live_volumes(), 0);
    }

    #[test]
    fn test_volume_alloc_failure() {
        let glfs = cluster();
        glfs.set_faults(MockFaults {
            new_volume: Some(Errno(libc::ENOMEM)),
            ..MockFaults::default()
        });
        let err = gluster_connect(&glfs, "gluster://h/testvol/a.img", &DriverConfig::default())
            .err();
        assert!(matches!(err, Some(GlusterError::VolumeAlloc { .. })));
        assert_eq!(glfs.live_volumes(), 0);
    }

    #[test]
    fn test_connect_rejects_bad_uri_without_allocating() {
        let glfs = cluster();
        let err = gluster_connect(&glfs, "gluster+unix://host/testvol/a.img", &DriverConfig::default())
            .err();
        assert_eq!(err.map(|e| e.to_errno()), Some(libc::EINVAL));
        assert!(glfs.volfile_servers().is_empty());
    }

    #[test]
    fn test_session_open_and_close() {
        let glfs = cluster();
        let session = Session::open(
            &glfs,
            "gluster://localhost/testvol/dir/a.img",
            OpenFlags::RDWR,
            &DriverConfig::default(),
        )
        .unwrap();
        assert!(session.is_open());
        assert_eq!(session.conf().image, "dir/a.img");
        assert!(session.fd().is_ok());
        assert!(session.volume().is_ok());
        assert_eq!((glfs.live_volumes(), glfs.open_fds()), (1, 1));

        session.close().unwrap();
        assert_eq!((glfs.live_volumes(), glfs.open_fds()), (0, 0));
    }

    #[test]
    fn test_session_open_missing_image_releases_volume() {
        let glfs = cluster();
        let err = Session::open(
            &glfs,
            "gluster://localhost/testvol/missing.img",
            OpenFlags::RDONLY,
            &DriverConfig::default(),
        )
        .err();
        assert_eq!(err.map(|e| e.to_errno()), Some(libc::ENOENT));
        assert_eq!((glfs.live_volumes(), glfs.open_fds()), (0, 0));
    }

    #[test]
    fn test_dropping_session_closes_it() {
        let glfs = cluster();
        let session = Session::open(
            &glfs,
            "gluster:///testvol/dir/a.img",
            OpenFlags::RDONLY,
            &DriverConfig::default(),
        )
        .unwrap();
        drop(session);
        assert_eq!((glfs.live_volumes(), glfs.open_fds()), (0, 0));
    }

    #[test]
    fn test_close_releases_both_on_error() {
        let glfs = cluster();
        let session = Session::open(
            &glfs,
            "gluster:///testvol/dir/a.img",
            OpenFlags::RDONLY,
            &DriverConfig::default(),
        )
        .unwrap();
        glfs.set_faults(MockFaults {
            close: Some(Errno(libc::EIO)),
            ..MockFaults::default()
        });
        let err = session.close().unwrap_err();
        assert_eq!(err.to_errno(), libc::EIO);
        assert_eq!((glfs.live_volumes(), glfs.open_fds()), (0, 0));
    }
}
