use std::fmt::Write;

use super::{from_path, to_path, Scheme, TileAddress};

fn parse_addr(line: &str) -> TileAddress {
    let parts: Vec<u32> = line.split('/').map(|p| p.trim().parse().unwrap()).collect();
    TileAddress::new(parts[0] as u8, parts[1], parts[2])
}

#[test]
fn test_translate() {
    datadriven::walk("src/scheme/testdata/", |f| {
        f.run(|test_case| {
            let scheme: Scheme = test_case
                .args
                .get("scheme")
                .expect("scheme argument is required")[0]
                .parse()
                .unwrap();
            let mut out = String::new();
            match test_case.directive.as_str() {
                "to-path" => {
                    for line in test_case.input.lines() {
                        match to_path(scheme, parse_addr(line)) {
                            Ok(p) => writeln!(&mut out, "{}", p).unwrap(),
                            Err(e) => writeln!(&mut out, "error: {}", e).unwrap(),
                        }
                    }
                }
                "from-path" => {
                    for line in test_case.input.lines() {
                        let segs: Vec<&str> = line.trim().split('/').collect();
                        match from_path(scheme, &segs) {
                            Ok(a) => writeln!(&mut out, "{}", a).unwrap(),
                            Err(e) => writeln!(&mut out, "error: {}", e).unwrap(),
                        }
                    }
                }
                _ => panic!("unhandled"),
            }
            out
        })
    })
}
